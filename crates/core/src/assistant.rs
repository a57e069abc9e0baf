//! The per-session turn driver.
//!
//! An [`AssistantSession`] owns one client's conversation window and speaking
//! flag, and runs each turn end to end: classify, route, stream.

use crate::{
    InputKind,
    conversation::ConversationWindow,
    intent::IntentClassifier,
    prompts,
    router::IntentRouter,
    stream::{PipelineOutcome, ResponsePipeline, SpeakingFlag, StreamEvent},
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

/// One unit of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Text(String),
    /// Base64 WAV audio.
    Audio(String),
    Image {
        /// Base64 image, with or without a `data:` prefix.
        image: String,
        description: String,
    },
}

impl UserInput {
    pub fn kind(&self) -> InputKind {
        match self {
            UserInput::Text(_) => InputKind::Text,
            UserInput::Audio(_) => InputKind::Audio,
            UserInput::Image { .. } => InputKind::Image,
        }
    }
}

/// Events produced by a turn, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    SpeakingStarted,
    SuggestedAction(Value),
    Stream(StreamEvent),
}

impl From<StreamEvent> for TurnEvent {
    fn from(event: StreamEvent) -> Self {
        TurnEvent::Stream(event)
    }
}

pub struct AssistantSession {
    classifier: Arc<IntentClassifier>,
    router: Arc<IntentRouter>,
    window: ConversationWindow,
    speaking: SpeakingFlag,
}

impl AssistantSession {
    pub fn new(
        classifier: Arc<IntentClassifier>,
        router: Arc<IntentRouter>,
        history_pairs: usize,
    ) -> Self {
        Self {
            classifier,
            router,
            window: ConversationWindow::new(history_pairs),
            speaking: SpeakingFlag::new(),
        }
    }

    /// A handle on the speaking flag that can stop the current answer
    /// without locking the session.
    pub fn speaking_flag(&self) -> SpeakingFlag {
        self.speaking.clone()
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    /// Runs one turn, sending its events to `events`.
    ///
    /// A failed speech or image recognition sends a single
    /// `Stream(Error)` event; otherwise the sequence is `SpeakingStarted`,
    /// an optional `SuggestedAction`, then the answer stream events.
    ///
    /// The speaking flag is raised before classification, so a stop
    /// request that arrives while the turn is still being understood
    /// cancels it and nothing is sent.
    #[instrument(skip_all, fields(input = %input.kind()))]
    pub async fn process_turn(
        &mut self,
        input: UserInput,
        events: &mpsc::Sender<TurnEvent>,
    ) -> PipelineOutcome {
        self.speaking.start();
        let mut suggestion = None;
        let stream = match input {
            UserInput::Text(text) => {
                self.window.push_user(text.as_str());
                let intent = self.classifier.classify(&text).await;
                self.router.route(&intent, &text, &self.window.recent()).await
            }
            UserInput::Audio(audio) => match self.classifier.classify_audio(&audio).await {
                Ok(audio) => {
                    info!(transcription = %audio.transcription, "Speech recognized");
                    self.window.push_user(audio.transcription.as_str());
                    self.router
                        .route(&audio.result, &audio.transcription, &self.window.recent())
                        .await
                }
                Err(e) => {
                    error!(error = ?e, "Speech recognition failed");
                    return self.fail(events, prompts::SPEECH_RECOGNITION_FAILED).await;
                }
            },
            UserInput::Image { image, description } => {
                match self.classifier.classify_image(&image, &description).await {
                    Ok(image) => {
                        self.window.push_user(prompts::image_answer(
                            image.kind.label(),
                            &description,
                            &image.ocr_text,
                            &image.extracted_info,
                        ));
                        suggestion = image.actionable_suggestion().cloned();
                        self.router.route_image(&image, &self.window.recent()).await
                    }
                    Err(e) => {
                        error!(error = ?e, "Image recognition failed");
                        return self.fail(events, prompts::IMAGE_RECOGNITION_FAILED).await;
                    }
                }
            }
        };

        if !self.speaking.is_speaking() {
            info!("Stopped before the answer started");
            return PipelineOutcome::Cancelled;
        }
        let _ = events.send(TurnEvent::SpeakingStarted).await;
        if let Some(action) = suggestion {
            let _ = events.send(TurnEvent::SuggestedAction(action)).await;
        }
        ResponsePipeline::new(&self.speaking, events)
            .run(stream, &mut self.window)
            .await
    }

    async fn fail(&self, events: &mpsc::Sender<TurnEvent>, message: &str) -> PipelineOutcome {
        self.speaking.stop();
        let _ = events
            .send(TurnEvent::Stream(StreamEvent::Error(message.to_string())))
            .await;
        PipelineOutcome::Failed {
            message: message.to_string(),
        }
    }
}
