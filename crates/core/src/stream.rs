//! The response pipeline: turns an answer stream into ordered client events,
//! honoring cancellation through the shared speaking flag.

use crate::{
    conversation::ConversationWindow,
    llm_client::AnswerStream,
};
use futures::StreamExt;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One event produced while streaming an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Transcript(String),
    AudioChunk {
        sequence_id: u64,
        /// Base64-encoded audio.
        payload: String,
        /// Length of the encoded payload.
        size: usize,
    },
    End,
    Error(String),
}

/// Whether the assistant is currently speaking.
///
/// Clones share the same flag: the pipeline checks it before every emission
/// and a stop request from the client clears it.
#[derive(Debug, Clone, Default)]
pub struct SpeakingFlag(Arc<AtomicBool>);

impl SpeakingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { transcript: String },
    Cancelled,
    Failed { message: String },
}

/// Drives one answer stream to the client.
pub struct ResponsePipeline<'a, T> {
    speaking: &'a SpeakingFlag,
    events: &'a mpsc::Sender<T>,
    next_sequence: u64,
}

impl<'a, T> ResponsePipeline<'a, T>
where
    T: From<StreamEvent> + Send,
{
    pub fn new(speaking: &'a SpeakingFlag, events: &'a mpsc::Sender<T>) -> Self {
        Self {
            speaking,
            events,
            next_sequence: 0,
        }
    }

    /// Consumes `stream`, emitting transcript and audio events in arrival
    /// order and a final `End`.
    ///
    /// The accumulated transcript is appended to `window` as an assistant
    /// turn only when the stream completes normally and the transcript is
    /// non-empty. Cancellation emits nothing further; a stream error emits
    /// `Error` and discards the partial transcript.
    pub async fn run(
        mut self,
        mut stream: AnswerStream,
        window: &mut ConversationWindow,
    ) -> PipelineOutcome {
        let started = Instant::now();
        let mut transcript = String::new();

        while let Some(item) = stream.next().await {
            let partial = match item {
                Ok(partial) => partial,
                Err(err) => {
                    let message = err.to_string();
                    error!(error = %message, "Answer stream failed");
                    self.emit(StreamEvent::Error(message.clone())).await;
                    self.speaking.stop();
                    return PipelineOutcome::Failed { message };
                }
            };
            if partial.is_empty() {
                continue;
            }

            if let Some(text) = partial.transcript.filter(|t| !t.is_empty()) {
                transcript.push_str(&text);
                if !self.emit(StreamEvent::Transcript(text)).await {
                    return PipelineOutcome::Cancelled;
                }
            }
            if let Some(payload) = partial.audio.filter(|a| !a.is_empty()) {
                self.next_sequence += 1;
                if self.next_sequence == 1 {
                    info!(
                        latency_ms = started.elapsed().as_millis() as u64,
                        "First audio chunk ready"
                    );
                }
                let event = StreamEvent::AudioChunk {
                    sequence_id: self.next_sequence,
                    size: payload.len(),
                    payload,
                };
                if !self.emit(event).await {
                    return PipelineOutcome::Cancelled;
                }
            }
        }

        if !self.emit(StreamEvent::End).await {
            return PipelineOutcome::Cancelled;
        }
        self.speaking.stop();
        info!(
            audio_chunks = self.next_sequence,
            transcript_chars = transcript.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Answer streamed"
        );
        if !transcript.is_empty() {
            window.push_assistant(transcript.clone());
        }
        PipelineOutcome::Completed { transcript }
    }

    /// Sends `event` unless speaking has been stopped. Returns false when the
    /// event was not delivered.
    async fn emit(&self, event: StreamEvent) -> bool {
        if !self.speaking.is_speaking() {
            debug!("Speaking stopped; dropping remaining output");
            return false;
        }
        if self.events.send(T::from(event)).await.is_err() {
            warn!("Event receiver dropped; stopping answer");
            self.speaking.stop();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conversation::Role, llm_client::PartialResult};
    use async_openai::error::OpenAIError;
    use futures::stream;
    use tokio_stream::wrappers::ReceiverStream;

    fn answer(items: Vec<Result<PartialResult, OpenAIError>>) -> AnswerStream {
        Box::pin(stream::iter(items))
    }

    fn both(text: &str, audio: &str) -> PartialResult {
        PartialResult {
            transcript: Some(text.into()),
            audio: Some(audio.into()),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_events_follow_stream_order_and_end_once() {
        let speaking = SpeakingFlag::new();
        speaking.start();
        let (tx, rx) = mpsc::channel(16);
        let mut window = ConversationWindow::default();
        window.push_user("北京今天天气");

        let stream = answer(vec![
            Ok(PartialResult::transcript("今天")),
            Ok(PartialResult::audio("AAAA")),
            Ok(PartialResult::default()),
            Ok(both("晴", "BBBBBB")),
        ]);
        let outcome = ResponsePipeline::new(&speaking, &tx).run(stream, &mut window).await;
        drop(tx);

        assert_eq!(
            drain(rx).await,
            vec![
                StreamEvent::Transcript("今天".into()),
                StreamEvent::AudioChunk {
                    sequence_id: 1,
                    payload: "AAAA".into(),
                    size: 4
                },
                StreamEvent::Transcript("晴".into()),
                StreamEvent::AudioChunk {
                    sequence_id: 2,
                    payload: "BBBBBB".into(),
                    size: 6
                },
                StreamEvent::End,
            ]
        );
        assert_eq!(
            outcome,
            PipelineOutcome::Completed {
                transcript: "今天晴".into()
            }
        );
        assert!(!speaking.is_speaking());
        let last = window.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "今天晴");
    }

    #[tokio::test]
    async fn test_stop_mid_stream_suppresses_later_events() {
        let speaking = SpeakingFlag::new();
        speaking.start();
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(16);
        let (partials_tx, partials_rx) = mpsc::channel(16);
        let mut window = ConversationWindow::default();

        let stop = speaking.clone();
        let driver = tokio::spawn(async move {
            partials_tx
                .send(Ok(PartialResult::transcript("one")))
                .await
                .unwrap();
            partials_tx.send(Ok(PartialResult::audio("AA"))).await.unwrap();
            // Wait for the client to see both events, then stop speaking.
            let _ = rx.recv().await;
            let _ = rx.recv().await;
            stop.stop();
            partials_tx
                .send(Ok(PartialResult::transcript("two")))
                .await
                .unwrap();
            drop(partials_tx);
            let mut rest = Vec::new();
            while let Some(event) = rx.recv().await {
                rest.push(event);
            }
            rest
        });

        let stream: AnswerStream = Box::pin(ReceiverStream::new(partials_rx));
        let outcome = ResponsePipeline::new(&speaking, &tx).run(stream, &mut window).await;
        drop(tx);

        assert_eq!(outcome, PipelineOutcome::Cancelled);
        assert!(driver.await.unwrap().is_empty());
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_emits_error_and_discards_transcript() {
        let speaking = SpeakingFlag::new();
        speaking.start();
        let (tx, rx) = mpsc::channel(16);
        let mut window = ConversationWindow::default();

        let stream = answer(vec![
            Ok(PartialResult::transcript("partial")),
            Err(OpenAIError::StreamError("connection reset".into())),
        ]);
        let outcome = ResponsePipeline::new(&speaking, &tx).run(stream, &mut window).await;
        drop(tx);

        let events = drain(rx).await;
        assert_eq!(events[0], StreamEvent::Transcript("partial".into()));
        assert!(matches!(events[1], StreamEvent::Error(_)));
        assert_eq!(events.len(), 2);
        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
        assert!(!speaking.is_speaking());
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn test_not_speaking_emits_nothing() {
        let speaking = SpeakingFlag::new();
        let (tx, rx) = mpsc::channel(16);
        let mut window = ConversationWindow::default();

        let stream = answer(vec![Ok(PartialResult::transcript("ignored"))]);
        let outcome = ResponsePipeline::new(&speaking, &tx).run(stream, &mut window).await;
        drop(tx);

        assert_eq!(outcome, PipelineOutcome::Cancelled);
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_audio_only_answer_is_not_persisted() {
        let speaking = SpeakingFlag::new();
        speaking.start();
        let (tx, rx) = mpsc::channel(16);
        let mut window = ConversationWindow::default();

        let stream = answer(vec![Ok(PartialResult::audio("AAAA"))]);
        let outcome = ResponsePipeline::new(&speaking, &tx).run(stream, &mut window).await;
        drop(tx);

        assert_eq!(drain(rx).await.last(), Some(&StreamEvent::End));
        assert_eq!(
            outcome,
            PipelineOutcome::Completed {
                transcript: String::new()
            }
        );
        assert!(window.is_empty());
    }
}
