use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use serde_json::{Value, json};
use std::pin::Pin;

/// One incremental unit of a streaming answer.
///
/// Either field may be absent; a partial with neither carries nothing and is
/// skipped by the response pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialResult {
    pub transcript: Option<String>,
    /// Base64-encoded audio.
    pub audio: Option<String>,
}

impl PartialResult {
    pub fn transcript(text: impl Into<String>) -> Self {
        Self {
            transcript: Some(text.into()),
            audio: None,
        }
    }

    pub fn audio(data: impl Into<String>) -> Self {
        Self {
            transcript: None,
            audio: Some(data.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transcript.as_deref().is_none_or(str::is_empty)
            && self.audio.as_deref().is_none_or(str::is_empty)
    }
}

/// A lazily produced sequence of answer partials.
pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<PartialResult, OpenAIError>> + Send>>;

/// A stream that yields `text` as a single transcript partial.
pub fn static_answer(text: impl Into<String>) -> AnswerStream {
    Box::pin(stream::iter(vec![Ok::<_, OpenAIError>(
        PartialResult::transcript(text),
    )]))
}

/// A stream yielding `partials` in order, for tests.
#[cfg(test)]
pub(crate) fn scripted_answer(partials: Vec<PartialResult>) -> AnswerStream {
    Box::pin(stream::iter(partials.into_iter().map(Ok::<_, OpenAIError>)))
}

/// Output modalities requested from the answer model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputModality {
    Text,
    TextAndAudio,
}

impl OutputModality {
    fn labels(self) -> Vec<&'static str> {
        match self {
            OutputModality::Text => vec!["text"],
            OutputModality::TextAndAudio => vec!["text", "audio"],
        }
    }
}

/// A generic client for an OpenAI-compatible chat model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Makes a single, non-streaming call and returns the message text.
    async fn complete(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<String>;

    /// Starts a streaming answer in the requested modality.
    async fn stream_answer(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        modality: OutputModality,
    ) -> Result<AnswerStream>;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
///
/// Requests are sent as raw JSON so provider extensions (output modalities,
/// voice selection, `enable_thinking`) can ride along with the typed fields.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
    voice: String,
    extra_body: Option<Value>,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "qwen-omni-turbo").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            voice: "Chelsie".to_string(),
            extra_body: None,
        }
    }

    /// Sets the synthesized voice used for audio output.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    /// Merges `extra` into every request body, e.g. `{"enable_thinking": false}`.
    pub fn with_extra_body(mut self, extra: Value) -> Self {
        self.extra_body = Some(extra);
        self
    }

    fn request_body(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        stream: bool,
    ) -> Result<Value> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages);
        if stream {
            args.stream(true);
        }
        let mut body = serde_json::to_value(args.build()?)?;
        if let (Some(map), Some(Value::Object(extra))) = (body.as_object_mut(), &self.extra_body) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    audio: Option<AudioDelta>,
}

#[derive(Debug, Deserialize)]
struct AudioDelta {
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

impl From<CompletionChunk> for PartialResult {
    fn from(chunk: CompletionChunk) -> Self {
        let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) else {
            return PartialResult::default();
        };
        let (audio_transcript, audio) = match delta.audio {
            Some(audio) => (audio.transcript, audio.data),
            None => (None, None),
        };
        let transcript = audio_transcript
            .filter(|t| !t.is_empty())
            .or(delta.content)
            .filter(|t| !t.is_empty());
        PartialResult {
            transcript,
            audio: audio.filter(|a| !a.is_empty()),
        }
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn complete(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<String> {
        let body = self.request_body(messages, false)?;
        let response: CreateChatCompletionResponse = self.client.chat().create_byot(body).await?;
        response
            .choices
            .into_iter()
            .next()
            .context("LLM response contained no choices")?
            .message
            .content
            .context("LLM response had no text content")
    }

    async fn stream_answer(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        modality: OutputModality,
    ) -> Result<AnswerStream> {
        let mut body = self.request_body(messages, true)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("modalities".into(), json!(modality.labels()));
            if modality == OutputModality::TextAndAudio {
                map.insert("audio".into(), json!({ "voice": self.voice, "format": "wav" }));
            }
            map.insert("stream_options".into(), json!({ "include_usage": true }));
        }

        let stream: Pin<Box<dyn Stream<Item = Result<CompletionChunk, OpenAIError>> + Send>> =
            self.client.chat().create_stream_byot(body).await?;
        Ok(Box::pin(stream.map(|chunk| chunk.map(PartialResult::from))))
    }
}

/// Builds a system message.
pub fn system_message(text: impl Into<String>) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(text.into())
        .build()?
        .into())
}

/// Builds a plain-text user message.
pub fn user_message(text: impl Into<String>) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(text.into())
        .build()?
        .into())
}
