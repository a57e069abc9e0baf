//! Prompt text for classification and answer generation.

use std::collections::HashMap;

/// Instruction for classifying a typed utterance.
pub const INTENT_CLASSIFICATION: &str = r#"You are an intent recognition assistant. Analyse the user's message and identify its intent and entities.

Intent types:
1. knowledge_base: a question that needs the company knowledge base
2. weather: a weather query
3. financial: a question about financial data or reports
4. conversation: small talk
5. history: a question about earlier turns of this conversation
6. take_leave: a leave request

Entity types: location, time, topic, person, organization.

Reply with a single JSON object and nothing else:
{"intent": "<intent type>", "entities": {"location": "北京", "time": "今天"}, "confidence": 0.95}"#;

/// Instruction for classifying and transcribing recorded speech.
pub const AUDIO_CLASSIFICATION: &str = r#"You are a voice assistant. Analyse the user's speech, identify the intent and reply with a single JSON object in exactly this shape:
{"intent": "knowledge_base|weather|financial|conversation|history|take_leave", "transcription": "the user's words, verbatim", "entities": {"location": "", "time": "", "topic": ""}, "confidence": 0.95}
Reply with JSON only."#;

/// Text part sent alongside the audio clip.
pub const AUDIO_CLASSIFICATION_REQUEST: &str = "Identify the intent of this recording and reply with the JSON result.";

/// Assistant acknowledgement placed after an instruction given as a user turn.
pub const INSTRUCTION_ACK: &str = "Understood, I will follow these instructions.";

/// Instruction for reading an image together with the user's description.
pub fn image_classification(description: &str) -> String {
    format!(
        r#"You are an office assistant. Read the uploaded image and the user's description, extract any text, identify the intent and suggest a system action.

User description: {description}

Reply with a single JSON object and nothing else:
{{
  "intent": "take_leave|reimbursement|attendance|document_review|system_navigation|knowledge_base",
  "ocr_text": "all text found in the image",
  "extracted_info": {{"date": "", "amount": "", "reason": "", "person": "", "location": ""}},
  "suggested_action": {{
    "action_type": "navigate_to_page|auto_fill_form|process_document",
    "target_page": "e.g. leave_application, reimbursement_form",
    "auto_fill_data": {{"field_name": "field_value"}}
  }},
  "confidence": 0.95
}}

Intents: take_leave (sick notes, leave forms), reimbursement (invoices, receipts), attendance (clock-in records), document_review, system_navigation, knowledge_base."#
    )
}

pub const KNOWLEDGE_ANSWER: &str = "You are a knowledge base assistant. Answer the user's question from the provided documents. If the documents do not contain the answer, say so plainly. Answer in the user's language.";

pub const WEATHER_ANSWER: &str = "You are a weather assistant. Answer the user's question from the weather data provided. Mention temperature, conditions and anything notable such as rain or strong wind, and keep it short enough to be spoken aloud. Answer in the user's language.";

pub const FINANCIAL_ANSWER: &str = "You are a financial data assistant. Answer the user's question from the financial query result provided. Quote figures exactly. Answer in the user's language.";

pub const HISTORY_ANSWER: &str = "You are an assistant answering questions about the conversation so far. Use only the earlier turns shown. Answer in the user's language.";

pub const GENERAL_ANSWER: &str = "You are a helpful voice assistant. Answer briefly and in the user's language.";

/// Asks the model to deliver `apology` to the user.
pub fn apology_request(apology: &str) -> String {
    format!("Tell the user briefly and politely, in their language: {apology}")
}

/// Context message carrying a weather report.
pub fn weather_context(today: &str, location: &str, report_json: &str) -> String {
    format!("Today is {today}. Weather data for {location}: {report_json}")
}

/// Context message carrying a financial query result.
pub fn financial_context(result: &str) -> String {
    format!("Financial query result: {result}")
}

pub const LOCATION_NOT_RECOGNIZED: &str = "Sorry, I could not tell which city you mean. Please name the city.";
pub const WEATHER_UNAVAILABLE: &str = "Sorry, the weather service is not available right now.";
pub const WEATHER_LOCATION_UNKNOWN: &str = "Sorry, I could not find weather data for that place.";
pub const FINANCIAL_UNAVAILABLE: &str = "Sorry, the financial data service is not available right now.";
pub const FINANCIAL_TIMEOUT: &str = "Sorry, the financial data query took too long. Please try again.";
pub const FINANCIAL_FAILED: &str = "Sorry, the financial data query failed.";
pub const RETRIEVAL_FAILED: &str = "Sorry, I could not search the knowledge base just now.";
pub const ANSWER_FAILED: &str = "Sorry, I could not produce an answer just now.";
pub const SPEECH_RECOGNITION_FAILED: &str = "speech recognition failed";
pub const IMAGE_RECOGNITION_FAILED: &str = "image recognition failed";

/// Answer guidance for an image turn, keyed by the image intent label.
pub fn image_answer(
    intent_label: &str,
    description: &str,
    ocr_text: &str,
    extracted_info: &HashMap<String, String>,
) -> String {
    let mut info = format!("User description: {description}\nText found in the image: {ocr_text}");
    let mut details: Vec<_> = extracted_info
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .collect();
    if !details.is_empty() {
        details.sort();
        let details: Vec<String> = details.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        info.push_str(&format!("\nDetails extracted from the image: {}", details.join(", ")));
    }
    let guidance = match intent_label {
        "take_leave" => "This is a leave request. Help the user based on the image and description, and say clearly if they should open the leave application page.",
        "reimbursement" => "This is a reimbursement request. Give reimbursement advice based on the invoice or receipt.",
        "attendance" => "This is about attendance records. Summarise what the record shows and any problems with it.",
        "document_review" => "Review the document and point out anything that needs attention.",
        "system_navigation" => "The user needs help finding a system function. Give step-by-step directions.",
        _ => "Answer the user's question about the image.",
    };
    format!("{info}\n\n{guidance}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_answer_lists_extracted_details_in_order() {
        let extracted = HashMap::from([
            ("date".to_string(), "2024-05-01".to_string()),
            ("amount".to_string(), "120".to_string()),
            ("merchant".to_string(), "  ".to_string()),
        ]);

        let prompt = image_answer("reimbursement", "报销", "发票 ¥120", &extracted);

        assert!(prompt.contains("Details extracted from the image: amount: 120, date: 2024-05-01"));
        assert!(!prompt.contains("merchant"));
        assert!(prompt.contains("reimbursement request"));
    }

    #[test]
    fn image_answer_without_details_omits_the_line() {
        let prompt = image_answer("other", "", "", &HashMap::new());

        assert!(!prompt.contains("Details extracted"));
        assert!(prompt.ends_with("Answer the user's question about the image."));
    }
}
