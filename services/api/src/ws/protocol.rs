//! Defines the WebSocket message protocol between the browser client and the API server.

use chrono::{DateTime, Utc};
use parley_core::{InputKind, assistant::TurnEvent, stream::StreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Recorded speech as base64 WAV.
    AudioData { data: String },
    /// A typed question.
    TextData { text: String },
    /// A base64 image with an optional description of what the user wants.
    ImageData {
        image: String,
        #[serde(default, alias = "text")]
        description: String,
    },
    /// Interrupts the answer currently being spoken.
    StopSpeaking,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The assistant is about to answer.
    SpeakingStart,
    /// An action the client can offer, derived from an uploaded image.
    SuggestedAction {
        action: Value,
        #[serde(rename = "inputType")]
        input_type: InputKind,
    },
    /// A piece of the answer text.
    Transcript { text: String },
    /// A chunk of the spoken answer (base64 WAV).
    Audio {
        data: String,
        chunk_id: u64,
        /// Seconds since the Unix epoch when the chunk was sent.
        timestamp: f64,
        size: usize,
        #[serde(rename = "inputType")]
        input_type: InputKind,
    },
    SpeakingEnd {
        #[serde(rename = "inputType")]
        input_type: InputKind,
    },
    Error { message: String },
}

impl ServerMessage {
    /// Maps one turn event to the message delivered for it.
    pub fn from_turn_event(event: TurnEvent, input_type: InputKind, now: DateTime<Utc>) -> Self {
        match event {
            TurnEvent::SpeakingStarted => ServerMessage::SpeakingStart,
            TurnEvent::SuggestedAction(action) => ServerMessage::SuggestedAction { action, input_type },
            TurnEvent::Stream(StreamEvent::Transcript(text)) => ServerMessage::Transcript { text },
            TurnEvent::Stream(StreamEvent::AudioChunk {
                sequence_id,
                payload,
                size,
            }) => ServerMessage::Audio {
                data: payload,
                chunk_id: sequence_id,
                timestamp: now.timestamp_millis() as f64 / 1000.0,
                size,
                input_type,
            },
            TurnEvent::Stream(StreamEvent::End) => ServerMessage::SpeakingEnd { input_type },
            TurnEvent::Stream(StreamEvent::Error(message)) => ServerMessage::Error { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn parses_client_messages() {
        let audio: ClientMessage =
            serde_json::from_str(r#"{"type":"audio_data","data":"UklGRg=="}"#).unwrap();
        assert_eq!(
            audio,
            ClientMessage::AudioData {
                data: "UklGRg==".to_string()
            }
        );

        let stop: ClientMessage = serde_json::from_str(r#"{"type":"stop_speaking"}"#).unwrap();
        assert_eq!(stop, ClientMessage::StopSpeaking);

        let text: ClientMessage =
            serde_json::from_str(r#"{"type":"text_data","text":"北京今天天气"}"#).unwrap();
        assert_eq!(
            text,
            ClientMessage::TextData {
                text: "北京今天天气".to_string()
            }
        );
    }

    #[test]
    fn image_description_is_optional() {
        let bare: ClientMessage =
            serde_json::from_str(r#"{"type":"image_data","image":"aGVsbG8="}"#).unwrap();
        assert_eq!(
            bare,
            ClientMessage::ImageData {
                image: "aGVsbG8=".to_string(),
                description: String::new()
            }
        );

        let aliased: ClientMessage = serde_json::from_str(
            r#"{"type":"image_data","image":"aGVsbG8=","text":"帮我报销"}"#,
        )
        .unwrap();
        assert!(matches!(
            aliased,
            ClientMessage::ImageData { description, .. } if description == "帮我报销"
        ));
    }

    #[test]
    fn rejects_unknown_message_types() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"init"}"#).is_err());
    }

    #[test]
    fn serializes_audio_with_client_field_names() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        let message = ServerMessage::from_turn_event(
            TurnEvent::Stream(StreamEvent::AudioChunk {
                sequence_id: 3,
                payload: "AAAA".to_string(),
                size: 4,
            }),
            InputKind::Audio,
            now,
        );

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "audio",
                "data": "AAAA",
                "chunk_id": 3,
                "timestamp": 1_700_000_000.25,
                "size": 4,
                "inputType": "audio"
            })
        );
    }

    #[test]
    fn maps_turn_events() {
        let now = Utc::now();
        assert_eq!(
            serde_json::to_value(ServerMessage::from_turn_event(
                TurnEvent::SpeakingStarted,
                InputKind::Text,
                now
            ))
            .unwrap(),
            json!({"type": "speaking_start"})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::from_turn_event(
                TurnEvent::Stream(StreamEvent::End),
                InputKind::Image,
                now
            ))
            .unwrap(),
            json!({"type": "speaking_end", "inputType": "image"})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::from_turn_event(
                TurnEvent::SuggestedAction(json!({"action_type": "navigate"})),
                InputKind::Image,
                now
            ))
            .unwrap(),
            json!({
                "type": "suggested_action",
                "action": {"action_type": "navigate"},
                "inputType": "image"
            })
        );
        assert_eq!(
            ServerMessage::from_turn_event(
                TurnEvent::Stream(StreamEvent::Error("speech recognition failed".into())),
                InputKind::Audio,
                now
            ),
            ServerMessage::Error {
                message: "speech recognition failed".to_string()
            }
        );
    }
}
