//! Intent classification for text, speech and image input.
//!
//! Model replies are parsed leniently: a strict JSON parse first, then the
//! first balanced `{...}` substring, then a fixed default. Classification of
//! typed text never fails.

use crate::{
    llm_client::{LLMClient, OutputModality, system_message, user_message},
    prompts,
};
use anyhow::Result;
use async_openai::{
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartAudio, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContentPart, ImageUrl, InputAudio, InputAudioFormat,
    },
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{collections::HashMap, fmt, sync::Arc, time::Instant};
use tracing::{info, warn};

/// The classified purpose of a user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    KnowledgeQuery,
    Weather,
    Financial,
    ConversationHistory,
    Conversation,
    LeaveRequest,
    Unrecognized,
}

impl Intent {
    /// Maps a model-produced label onto an intent. Unknown labels map to
    /// [`Intent::Unrecognized`].
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "knowledge_base" | "knowledge_query" | "knowledge" => Intent::KnowledgeQuery,
            "weather" => Intent::Weather,
            "financial" | "finance" => Intent::Financial,
            "history" | "conversation_history" => Intent::ConversationHistory,
            "conversation" | "chat" => Intent::Conversation,
            "take_leave" | "leave" | "leave_request" => Intent::LeaveRequest,
            _ => Intent::Unrecognized,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Intent::KnowledgeQuery => "knowledge_base",
            Intent::Weather => "weather",
            Intent::Financial => "financial",
            Intent::ConversationHistory => "history",
            Intent::Conversation => "conversation",
            Intent::LeaveRequest => "take_leave",
            Intent::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classification of one user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentResult {
    pub intent: Intent,
    pub entities: HashMap<String, String>,
    /// Always within `[0, 1]`.
    pub confidence: f32,
}

impl IntentResult {
    /// The result used whenever a reply cannot be parsed.
    pub fn fallback() -> Self {
        Self {
            intent: Intent::KnowledgeQuery,
            entities: HashMap::new(),
            confidence: 0.5,
        }
    }

    /// A non-blank entity value.
    pub fn entity(&self, name: &str) -> Option<&str> {
        self.entities
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Classification of a recorded utterance, with its transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioIntent {
    pub result: IntentResult,
    pub transcription: String,
}

/// What an uploaded image is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageIntentKind {
    TakeLeave,
    Reimbursement,
    Attendance,
    DocumentReview,
    SystemNavigation,
    KnowledgeBase,
}

impl ImageIntentKind {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "take_leave" => ImageIntentKind::TakeLeave,
            "reimbursement" => ImageIntentKind::Reimbursement,
            "attendance" => ImageIntentKind::Attendance,
            "document_review" => ImageIntentKind::DocumentReview,
            "system_navigation" => ImageIntentKind::SystemNavigation,
            _ => ImageIntentKind::KnowledgeBase,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImageIntentKind::TakeLeave => "take_leave",
            ImageIntentKind::Reimbursement => "reimbursement",
            ImageIntentKind::Attendance => "attendance",
            ImageIntentKind::DocumentReview => "document_review",
            ImageIntentKind::SystemNavigation => "system_navigation",
            ImageIntentKind::KnowledgeBase => "knowledge_base",
        }
    }
}

/// Classification of an image turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageIntent {
    pub kind: ImageIntentKind,
    pub ocr_text: String,
    pub extracted_info: HashMap<String, String>,
    /// Free-form action the client may offer, e.g. opening a form.
    pub suggested_action: Value,
    pub confidence: f32,
}

impl ImageIntent {
    /// The suggested action, unless it is empty or marks an error.
    pub fn actionable_suggestion(&self) -> Option<&Value> {
        let action = self.suggested_action.as_object()?;
        if action.is_empty() {
            return None;
        }
        match action.get("action_type").and_then(Value::as_str) {
            Some("error") => None,
            _ => Some(&self.suggested_action),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    intent: String,
    #[serde(default)]
    entities: Value,
    #[serde(default)]
    confidence: Value,
    #[serde(default)]
    transcription: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawImageIntent {
    intent: String,
    #[serde(default)]
    ocr_text: String,
    #[serde(default)]
    extracted_info: Value,
    #[serde(default)]
    suggested_action: Value,
    #[serde(default)]
    confidence: Value,
}

/// Returns the first balanced `{...}` substring, ignoring braces inside
/// JSON strings.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_lenient<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    serde_json::from_str(text.trim()).ok().or_else(|| {
        first_json_object(text).and_then(|object| serde_json::from_str(object).ok())
    })
}

fn entity_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Accepts entities either as an object or as a list of `{type, value}`.
fn entities_from(value: &Value) -> HashMap<String, String> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| entity_value(v).map(|v| (k.clone(), v)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let name = item
                    .get("type")
                    .or_else(|| item.get("name"))
                    .and_then(Value::as_str)?;
                let value = item.get("value").and_then(entity_value)?;
                Some((name.to_string(), value))
            })
            .collect(),
        _ => HashMap::new(),
    }
}

fn confidence_from(value: &Value) -> f32 {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    raw.filter(|c| c.is_finite())
        .map_or(0.5, |c| c.clamp(0.0, 1.0) as f32)
}

impl From<&RawIntent> for IntentResult {
    fn from(raw: &RawIntent) -> Self {
        Self {
            intent: Intent::from_label(&raw.intent),
            entities: entities_from(&raw.entities),
            confidence: confidence_from(&raw.confidence),
        }
    }
}

/// Parses a classification reply, falling back to [`IntentResult::fallback`].
pub fn parse_intent(reply: &str) -> IntentResult {
    match parse_lenient::<RawIntent>(reply) {
        Some(raw) => IntentResult::from(&raw),
        None => {
            warn!(reply, "Unparseable intent reply; using default intent");
            IntentResult::fallback()
        }
    }
}

/// Parses a speech classification reply. The fallback keeps the raw reply
/// as the transcription.
pub fn parse_audio_intent(reply: &str) -> AudioIntent {
    match parse_lenient::<RawIntent>(reply) {
        Some(raw) => AudioIntent {
            result: IntentResult::from(&raw),
            transcription: raw.transcription.unwrap_or_default().trim().to_string(),
        },
        None => {
            warn!(reply, "Unparseable speech intent reply; using default intent");
            AudioIntent {
                result: IntentResult::fallback(),
                transcription: reply.trim().to_string(),
            }
        }
    }
}

/// Parses an image classification reply. The fallback keeps the raw reply
/// as OCR text and suggests processing the document.
pub fn parse_image_intent(reply: &str) -> ImageIntent {
    match parse_lenient::<RawImageIntent>(reply) {
        Some(raw) => ImageIntent {
            kind: ImageIntentKind::from_label(&raw.intent),
            ocr_text: raw.ocr_text,
            extracted_info: entities_from(&raw.extracted_info),
            suggested_action: raw.suggested_action,
            confidence: confidence_from(&raw.confidence),
        },
        None => {
            warn!("Unparseable image intent reply; using default");
            ImageIntent {
                kind: ImageIntentKind::KnowledgeBase,
                ocr_text: reply.trim().to_string(),
                extracted_info: HashMap::new(),
                suggested_action: json!({
                    "action_type": "process_document",
                    "target_page": "",
                    "auto_fill_data": {}
                }),
                confidence: 0.5,
            }
        }
    }
}

fn data_uri(payload: &str, prefix: &str, default_mime: &str) -> String {
    if payload.starts_with(prefix) {
        payload.to_string()
    } else {
        format!("data:{default_mime};base64,{payload}")
    }
}

/// Classifies user input with the configured models.
pub struct IntentClassifier {
    text: Arc<dyn LLMClient>,
    omni: Arc<dyn LLMClient>,
    vision: Arc<dyn LLMClient>,
}

impl IntentClassifier {
    /// # Arguments
    ///
    /// * `text` - Model used for typed utterances.
    /// * `omni` - Audio-capable model used for recorded speech.
    /// * `vision` - Vision model used for images.
    pub fn new(text: Arc<dyn LLMClient>, omni: Arc<dyn LLMClient>, vision: Arc<dyn LLMClient>) -> Self {
        Self { text, omni, vision }
    }

    /// Classifies a typed utterance. Never fails.
    pub async fn classify(&self, utterance: &str) -> IntentResult {
        let started = Instant::now();
        let messages = match text_classification_messages(utterance) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Failed to build classification request");
                return IntentResult::fallback();
            }
        };
        let result = match self.text.complete(messages).await {
            Ok(reply) => parse_intent(&reply),
            Err(e) => {
                warn!(error = %e, "Intent classification call failed; using default intent");
                IntentResult::fallback()
            }
        };
        info!(
            intent = %result.intent,
            confidence = result.confidence,
            entities = ?result.entities,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classified utterance"
        );
        result
    }

    /// Transcribes and classifies base64 WAV audio.
    pub async fn classify_audio(&self, audio_base64: &str) -> Result<AudioIntent> {
        let started = Instant::now();
        let messages = audio_classification_messages(audio_base64)?;
        let mut stream = self.omni.stream_answer(messages, OutputModality::Text).await?;
        let mut reply = String::new();
        while let Some(partial) = stream.next().await {
            if let Some(text) = partial?.transcript {
                reply.push_str(&text);
            }
        }
        let audio = parse_audio_intent(&reply);
        info!(
            intent = %audio.result.intent,
            transcription = %audio.transcription,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classified speech"
        );
        Ok(audio)
    }

    /// Reads and classifies a base64 image with its description.
    pub async fn classify_image(&self, image_base64: &str, description: &str) -> Result<ImageIntent> {
        let started = Instant::now();
        let messages = image_classification_messages(image_base64, description)?;
        let reply = self.vision.complete(messages).await?;
        let image = parse_image_intent(&reply);
        info!(
            intent = image.kind.label(),
            confidence = image.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classified image"
        );
        Ok(image)
    }
}

fn text_classification_messages(
    utterance: &str,
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    Ok(vec![
        system_message(prompts::INTENT_CLASSIFICATION)?,
        user_message(utterance)?,
    ])
}

fn audio_classification_messages(
    audio_base64: &str,
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let parts = vec![
        ChatCompletionRequestUserMessageContentPart::InputAudio(
            ChatCompletionRequestMessageContentPartAudio {
                input_audio: InputAudio {
                    data: data_uri(audio_base64, "data:audio/", "audio/wav"),
                    format: InputAudioFormat::Wav,
                },
            },
        ),
        ChatCompletionRequestUserMessageContentPart::Text(ChatCompletionRequestMessageContentPartText {
            text: prompts::AUDIO_CLASSIFICATION_REQUEST.to_string(),
        }),
    ];
    Ok(vec![
        user_message(prompts::AUDIO_CLASSIFICATION)?,
        ChatCompletionRequestAssistantMessageArgs::default()
            .content(prompts::INSTRUCTION_ACK)
            .build()?
            .into(),
        ChatCompletionRequestUserMessageArgs::default()
            .content(parts)
            .build()?
            .into(),
    ])
}

fn image_classification_messages(
    image_base64: &str,
    description: &str,
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let parts = vec![
        ChatCompletionRequestUserMessageContentPart::Text(ChatCompletionRequestMessageContentPartText {
            text: prompts::image_classification(description),
        }),
        ChatCompletionRequestUserMessageContentPart::ImageUrl(
            ChatCompletionRequestMessageContentPartImage {
                image_url: ImageUrl {
                    url: data_uri(image_base64, "data:image/", "image/png"),
                    detail: None,
                },
            },
        ),
    ];
    Ok(vec![
        ChatCompletionRequestUserMessageArgs::default()
            .content(parts)
            .build()?
            .into(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{MockLLMClient, PartialResult, scripted_answer};
    use anyhow::anyhow;

    fn classifier(text: MockLLMClient, omni: MockLLMClient, vision: MockLLMClient) -> IntentClassifier {
        IntentClassifier::new(Arc::new(text), Arc::new(omni), Arc::new(vision))
    }

    #[test]
    fn test_strict_reply_is_parsed() {
        let result = parse_intent(
            r#"{"intent": "weather", "entities": {"location": "北京", "time": "今天"}, "confidence": 0.92}"#,
        );
        assert_eq!(result.intent, Intent::Weather);
        assert_eq!(result.entity("location"), Some("北京"));
        assert_eq!(result.entity("time"), Some("今天"));
        assert!((result.confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_object_embedded_in_prose_is_extracted() {
        let reply = "Sure! Here is the result:\n```json\n{\"intent\": \"financial\", \"entities\": {\"topic\": \"revenue {Q3}\"}}\n```\nAnything else? {not json}";
        let result = parse_intent(reply);
        assert_eq!(result.intent, Intent::Financial);
        assert_eq!(result.entity("topic"), Some("revenue {Q3}"));
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_unparseable_reply_falls_back_to_knowledge_query() {
        for reply in ["", "I think it's about weather", "{\"entities\": {}}", "{\"intent\": 3"] {
            assert_eq!(parse_intent(reply), IntentResult::fallback(), "reply: {reply}");
        }
    }

    #[test]
    fn test_entity_list_and_out_of_range_confidence() {
        let result = parse_intent(
            r#"{"intent": "take leave", "entities": [{"type": "time", "value": "明天"}, {"type": "person", "value": ""}], "confidence": 7}"#,
        );
        assert_eq!(result.intent, Intent::LeaveRequest);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entity("time"), Some("明天"));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_labels_map_to_intents() {
        assert_eq!(Intent::from_label("knowledge_base"), Intent::KnowledgeQuery);
        assert_eq!(Intent::from_label("History"), Intent::ConversationHistory);
        assert_eq!(Intent::from_label("conversation"), Intent::Conversation);
        assert_eq!(Intent::from_label("news"), Intent::Unrecognized);
    }

    #[test]
    fn test_first_json_object_respects_strings() {
        let text = r#"noise {"a": "}", "b": {"c": 1}} trailing }"#;
        assert_eq!(first_json_object(text), Some(r#"{"a": "}", "b": {"c": 1}}"#));
        assert_eq!(first_json_object("{unterminated"), None);
    }

    #[test]
    fn test_audio_fallback_keeps_raw_text() {
        let audio = parse_audio_intent("北京明天会下雨吗");
        assert_eq!(audio.result, IntentResult::fallback());
        assert_eq!(audio.transcription, "北京明天会下雨吗");
    }

    #[test]
    fn test_image_reply_and_suggestion() {
        let image = parse_image_intent(
            r#"{"intent": "reimbursement", "ocr_text": "发票 ¥120", "extracted_info": {"amount": "120"},
                "suggested_action": {"action_type": "auto_fill_form", "target_page": "reimbursement_form"}, "confidence": 0.8}"#,
        );
        assert_eq!(image.kind, ImageIntentKind::Reimbursement);
        assert_eq!(image.extracted_info.get("amount").map(String::as_str), Some("120"));
        assert_eq!(
            image.actionable_suggestion().and_then(|a| a.get("target_page")),
            Some(&json!("reimbursement_form"))
        );

        let errored = parse_image_intent(
            r#"{"intent": "take_leave", "suggested_action": {"action_type": "error"}}"#,
        );
        assert!(errored.actionable_suggestion().is_none());
    }

    #[test]
    fn test_unparseable_image_reply_suggests_processing() {
        let image = parse_image_intent("a photo of a receipt");
        assert_eq!(image.kind, ImageIntentKind::KnowledgeBase);
        assert_eq!(image.ocr_text, "a photo of a receipt");
        assert_eq!(image.suggested_action["action_type"], "process_document");
    }

    #[tokio::test]
    async fn test_classify_never_fails() {
        let mut text = MockLLMClient::new();
        text.expect_complete()
            .times(1)
            .returning(|_| Err(anyhow!("connection refused")));
        let classifier = classifier(text, MockLLMClient::new(), MockLLMClient::new());

        assert_eq!(classifier.classify("随便聊聊").await, IntentResult::fallback());
    }

    #[tokio::test]
    async fn test_classify_audio_collects_streamed_reply() {
        let mut omni = MockLLMClient::new();
        omni.expect_stream_answer()
            .withf(|messages, modality| messages.len() == 3 && *modality == OutputModality::Text)
            .returning(|_, _| {
                Ok(scripted_answer(vec![
                    PartialResult::transcript(r#"{"intent": "weather", "transcription": "上海"#),
                    PartialResult::transcript(
                        r#"现在天气", "entities": {"location": "上海", "time": "现在"}}"#,
                    ),
                ]))
            });
        let classifier = classifier(MockLLMClient::new(), omni, MockLLMClient::new());

        let audio = classifier.classify_audio("UklGRg==").await.unwrap();
        assert_eq!(audio.result.intent, Intent::Weather);
        assert_eq!(audio.transcription, "上海现在天气");
        assert_eq!(audio.result.entity("time"), Some("现在"));
    }

    #[tokio::test]
    async fn test_classify_image_propagates_model_failure() {
        let mut vision = MockLLMClient::new();
        vision
            .expect_complete()
            .returning(|_| Err(anyhow!("model overloaded")));
        let classifier = classifier(MockLLMClient::new(), MockLLMClient::new(), vision);

        assert!(classifier.classify_image("iVBORw0KGgo=", "请假条").await.is_err());
    }
}
