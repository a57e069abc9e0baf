//! Dispatch of a classified turn to exactly one handler.
//!
//! Every path converges to an answer stream: handler failures become a short
//! apology, generated by the model when possible and static otherwise.

use crate::{
    conversation::{Turn, to_request_messages},
    error::{BackendError, ToolServerError},
    intent::{ImageIntent, Intent, IntentResult},
    llm_client::{
        AnswerStream, LLMClient, OutputModality, static_answer, system_message, user_message,
    },
    prompts,
    retrieval::Retriever,
    tools::{FINANCIAL_SERVER, ToolInvoker, joined_text},
    weather::{WeatherBackend, WeatherQuery, find_known_city},
};
use async_openai::{
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartText,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
    },
};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tracing::{error, info, warn};

/// The handler a turn is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Weather,
    Financial,
    Retrieval,
    History,
}

impl Handler {
    /// The fixed routing table. Anything unmapped goes to retrieval.
    pub fn for_intent(intent: Intent) -> Self {
        match intent {
            Intent::Weather => Handler::Weather,
            Intent::Financial => Handler::Financial,
            Intent::KnowledgeQuery => Handler::Retrieval,
            Intent::ConversationHistory => Handler::History,
            Intent::Conversation | Intent::LeaveRequest | Intent::Unrecognized => {
                Handler::Retrieval
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    /// Documents requested from the retriever.
    pub top_k: usize,
    pub modality: OutputModality,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            modality: OutputModality::TextAndAudio,
        }
    }
}

/// A user-facing apology produced by a failed handler.
#[derive(Debug)]
struct Apology(&'static str);

impl From<OpenAIError> for Apology {
    fn from(err: OpenAIError) -> Self {
        error!(error = %err, "Failed to build answer request");
        Apology(prompts::ANSWER_FAILED)
    }
}

pub struct IntentRouter {
    llm: Arc<dyn LLMClient>,
    weather: Arc<dyn WeatherBackend>,
    retriever: Arc<dyn Retriever>,
    tools: Arc<dyn ToolInvoker>,
    settings: RouterSettings,
}

impl IntentRouter {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        weather: Arc<dyn WeatherBackend>,
        retriever: Arc<dyn Retriever>,
        tools: Arc<dyn ToolInvoker>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            llm,
            weather,
            retriever,
            tools,
            settings,
        }
    }

    /// Answers a classified utterance. `history` already ends with the
    /// user's turn. Never fails.
    pub async fn route(
        &self,
        intent: &IntentResult,
        utterance: &str,
        history: &[Turn],
    ) -> AnswerStream {
        let handler = Handler::for_intent(intent.intent);
        info!(intent = %intent.intent, ?handler, confidence = intent.confidence, "Routing turn");
        let result = match handler {
            Handler::Weather => self.answer_weather(intent, utterance, history).await,
            Handler::Financial => self.answer_financial(utterance, history).await,
            Handler::Retrieval => self.answer_from_documents(utterance, history).await,
            Handler::History => self.answer_from_history(history).await,
        };
        match result {
            Ok(stream) => stream,
            Err(Apology(apology)) => self.error_response(apology, history).await,
        }
    }

    /// Answers an image turn. `history` already ends with the user's turn
    /// describing the image.
    pub async fn route_image(&self, image: &ImageIntent, history: &[Turn]) -> AnswerStream {
        info!(intent = image.kind.label(), "Routing image turn");
        match self.answer_image(history).await {
            Ok(stream) => stream,
            Err(Apology(apology)) => self.error_response(apology, history).await,
        }
    }

    async fn answer(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<AnswerStream, Apology> {
        self.llm
            .stream_answer(messages, self.settings.modality)
            .await
            .map_err(|e| {
                error!(error = ?e, "Answer call failed");
                Apology(prompts::ANSWER_FAILED)
            })
    }

    async fn answer_weather(
        &self,
        intent: &IntentResult,
        utterance: &str,
        history: &[Turn],
    ) -> Result<AnswerStream, Apology> {
        let location = intent
            .entity("location")
            .map(str::to_string)
            .or_else(|| find_known_city(utterance).map(str::to_string));
        let Some(location) = location else {
            warn!(utterance, "No location in weather query");
            return Err(Apology(prompts::LOCATION_NOT_RECOGNIZED));
        };
        let query = WeatherQuery::from_qualifier(intent.entity("time"));

        let started = Instant::now();
        let report = self
            .weather
            .get_weather(&location, query)
            .await
            .map_err(|e| {
                error!(%location, error = %e, "Weather lookup failed");
                match e {
                    BackendError::LocationNotFound(_) => Apology(prompts::WEATHER_LOCATION_UNKNOWN),
                    _ => Apology(prompts::WEATHER_UNAVAILABLE),
                }
            })?;
        info!(
            %location,
            query = query.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Weather report ready"
        );

        let report_json = serde_json::to_string(&report).map_err(|e| {
            error!(error = %e, "Failed to serialize weather report");
            Apology(prompts::WEATHER_UNAVAILABLE)
        })?;
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        let mut messages = vec![system_message(prompts::WEATHER_ANSWER)?];
        messages.extend(to_request_messages(history)?);
        messages.push(user_message(prompts::weather_context(
            &today,
            &location,
            &report_json,
        ))?);
        self.answer(messages).await
    }

    async fn answer_financial(
        &self,
        utterance: &str,
        history: &[Turn],
    ) -> Result<AnswerStream, Apology> {
        let tools = self.tools.clone();
        let mut arguments = serde_json::Map::new();
        arguments.insert("question".into(), json!(utterance));
        arguments.insert("report_type".into(), json!("all"));

        let outcome = tokio::task::spawn_blocking(move || {
            tools.call_tool(FINANCIAL_SERVER, "query_financial_data", arguments)
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Financial tool task failed");
            Apology(prompts::FINANCIAL_FAILED)
        })?;

        let contents = outcome.map_err(|e| {
            error!(error = %e, "Financial query failed");
            match e {
                ToolServerError::ToolTimeout { .. } => Apology(prompts::FINANCIAL_TIMEOUT),
                e if e.is_connect_failure() => Apology(prompts::FINANCIAL_UNAVAILABLE),
                _ => Apology(prompts::FINANCIAL_FAILED),
            }
        })?;

        let mut messages = vec![system_message(prompts::FINANCIAL_ANSWER)?];
        messages.extend(to_request_messages(history)?);
        messages.push(user_message(prompts::financial_context(&joined_text(
            &contents,
        )))?);
        self.answer(messages).await
    }

    async fn answer_from_documents(
        &self,
        utterance: &str,
        history: &[Turn],
    ) -> Result<AnswerStream, Apology> {
        let documents = self
            .retriever
            .retrieve(utterance, self.settings.top_k)
            .await
            .map_err(|e| {
                error!(error = %e, "Retrieval failed");
                Apology(prompts::RETRIEVAL_FAILED)
            })?;

        let mut messages = vec![system_message(prompts::KNOWLEDGE_ANSWER)?];
        messages.extend(to_request_messages(history)?);
        if !documents.is_empty() {
            messages.push(documents_message(documents)?);
        }
        self.answer(messages).await
    }

    async fn answer_image(&self, history: &[Turn]) -> Result<AnswerStream, Apology> {
        let mut messages = vec![system_message(prompts::GENERAL_ANSWER)?];
        messages.extend(to_request_messages(history)?);
        self.answer(messages).await
    }

    async fn answer_from_history(&self, history: &[Turn]) -> Result<AnswerStream, Apology> {
        let mut messages = vec![system_message(prompts::HISTORY_ANSWER)?];
        messages.extend(to_request_messages(history)?);
        self.answer(messages).await
    }

    /// Delivers `apology` through the model, or verbatim when that fails.
    async fn error_response(&self, apology: &'static str, history: &[Turn]) -> AnswerStream {
        let request = apology_messages(apology, history);
        match request {
            Ok(messages) => match self.llm.stream_answer(messages, self.settings.modality).await {
                Ok(stream) => return stream,
                Err(e) => warn!(error = ?e, "Apology generation failed; sending static text"),
            },
            Err(e) => warn!(error = %e, "Failed to build apology request"),
        }
        static_answer(apology)
    }
}

fn apology_messages(
    apology: &str,
    history: &[Turn],
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut messages = vec![system_message(prompts::GENERAL_ANSWER)?];
    messages.extend(to_request_messages(history)?);
    messages.push(user_message(prompts::apology_request(apology))?);
    Ok(messages)
}

/// One user message whose parts are the retrieved documents.
fn documents_message(documents: Vec<String>) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let parts: Vec<ChatCompletionRequestUserMessageContentPart> = documents
        .into_iter()
        .map(|text| {
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText { text },
            )
        })
        .collect();
    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(parts)
        .build()?
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conversation::{ConversationWindow, Role},
        llm_client::{MockLLMClient, PartialResult, scripted_answer},
        retrieval::MockRetriever,
        tools::{MockToolInvoker, ToolContent},
        weather::{DailyForecast, MockWeatherBackend, WeatherReport},
    };
    use anyhow::anyhow;
    use async_openai::types::{ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageContent};
    use futures::StreamExt;
    use std::collections::HashMap;

    /// Text of the last plain-text user message.
    fn last_user_text(messages: &[ChatCompletionRequestMessage]) -> String {
        messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    content: ChatCompletionRequestUserMessageContent::Text(text),
                    ..
                }) => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// An answer model that echoes the last user message as its transcript.
    fn echo_llm() -> MockLLMClient {
        let mut llm = MockLLMClient::new();
        llm.expect_stream_answer().returning(|messages, _| {
            Ok(scripted_answer(vec![PartialResult::transcript(last_user_text(&messages))]))
        });
        llm
    }

    fn router(
        llm: MockLLMClient,
        weather: MockWeatherBackend,
        retriever: MockRetriever,
        tools: MockToolInvoker,
    ) -> IntentRouter {
        IntentRouter::new(
            Arc::new(llm),
            Arc::new(weather),
            Arc::new(retriever),
            Arc::new(tools),
            RouterSettings::default(),
        )
    }

    fn intent(intent: Intent, entities: &[(&str, &str)]) -> IntentResult {
        IntentResult {
            intent,
            entities: entities
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            confidence: 0.9,
        }
    }

    fn history(utterance: &str) -> Vec<Turn> {
        let mut window = ConversationWindow::default();
        window.push_user(utterance);
        window.recent()
    }

    async fn transcript(stream: AnswerStream) -> String {
        stream
            .filter_map(|p| async move { p.ok().and_then(|p| p.transcript) })
            .collect::<Vec<_>>()
            .await
            .concat()
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(Handler::for_intent(Intent::Weather), Handler::Weather);
        assert_eq!(Handler::for_intent(Intent::Financial), Handler::Financial);
        assert_eq!(Handler::for_intent(Intent::KnowledgeQuery), Handler::Retrieval);
        assert_eq!(Handler::for_intent(Intent::ConversationHistory), Handler::History);
        assert_eq!(Handler::for_intent(Intent::Unrecognized), Handler::Retrieval);
        assert_eq!(Handler::for_intent(Intent::LeaveRequest), Handler::Retrieval);
    }

    #[tokio::test]
    async fn test_weather_uses_gazetteer_when_entity_missing() {
        let mut weather = MockWeatherBackend::new();
        weather
            .expect_get_weather()
            .withf(|location, query| location.to_string() == "上海" && *query == WeatherQuery::Now)
            .times(1)
            .returning(|_, _| {
                Ok(WeatherReport::Forecast {
                    location: "上海".into(),
                    days: vec![DailyForecast {
                        date: "2024-05-01".into(),
                        temp_max: 26.0,
                        temp_min: 18.0,
                        feels_like: 22.0,
                        humidity: 60.0,
                        wind_speed: 3.0,
                        visibility: None,
                        condition: "多云".into(),
                    }],
                })
            });
        let router = router(echo_llm(), weather, MockRetriever::new(), MockToolInvoker::new());

        let utterance = "上海现在热不热";
        let stream = router
            .route(&intent(Intent::Weather, &[("time", "现在")]), utterance, &history(utterance))
            .await;

        let text = transcript(stream).await;
        assert!(text.contains("上海"));
        assert!(text.contains("\"temp_max\":26.0"));
    }

    #[tokio::test]
    async fn test_weather_without_location_skips_backend() {
        let mut weather = MockWeatherBackend::new();
        weather.expect_get_weather().never();
        let mut llm = MockLLMClient::new();
        llm.expect_stream_answer()
            .returning(|_, _| Err(anyhow!("answer model down")));
        let router = router(llm, weather, MockRetriever::new(), MockToolInvoker::new());

        let utterance = "明天天气怎么样";
        let stream = router
            .route(&intent(Intent::Weather, &[]), utterance, &history(utterance))
            .await;

        assert_eq!(transcript(stream).await, prompts::LOCATION_NOT_RECOGNIZED);
    }

    #[tokio::test]
    async fn test_unrecognized_intent_retrieves_with_raw_utterance() {
        let mut retriever = MockRetriever::new();
        retriever
            .expect_retrieve()
            .withf(|question, top_k| question.to_string() == "公司的报销流程" && *top_k == 3)
            .times(1)
            .returning(|_, _| Ok(vec!["报销需在30天内提交".into()]));
        let mut llm = MockLLMClient::new();
        llm.expect_stream_answer()
            .withf(|messages, _| {
                matches!(
                    messages.last(),
                    Some(ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                        content: ChatCompletionRequestUserMessageContent::Array(parts),
                        ..
                    })) if parts.len() == 1
                )
            })
            .returning(|_, _| Ok(scripted_answer(vec![PartialResult::transcript("30天内")])));
        let router = router(llm, MockWeatherBackend::new(), retriever, MockToolInvoker::new());

        let utterance = "公司的报销流程";
        let stream = router
            .route(&IntentResult::fallback(), utterance, &history(utterance))
            .await;

        assert_eq!(transcript(stream).await, "30天内");
    }

    #[tokio::test]
    async fn test_financial_timeout_degrades_to_apology() {
        let mut tools = MockToolInvoker::new();
        tools
            .expect_call_tool()
            .withf(|server, tool, args| {
                server.to_string() == FINANCIAL_SERVER
                    && tool.to_string() == "query_financial_data"
                    && args["report_type"] == "all"
            })
            .returning(|_, _, _| {
                Err(ToolServerError::ToolTimeout {
                    tool: "query_financial_data".into(),
                })
            });
        let router = router(echo_llm(), MockWeatherBackend::new(), MockRetriever::new(), tools);

        let utterance = "今年的营收是多少";
        let stream = router
            .route(&intent(Intent::Financial, &[]), utterance, &history(utterance))
            .await;

        assert_eq!(
            transcript(stream).await,
            prompts::apology_request(prompts::FINANCIAL_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn test_financial_result_is_given_as_context() {
        let mut tools = MockToolInvoker::new();
        tools
            .expect_call_tool()
            .returning(|_, _, _| Ok(vec![ToolContent::Text("revenue: 1.2B".into())]));
        let router = router(echo_llm(), MockWeatherBackend::new(), MockRetriever::new(), tools);

        let utterance = "今年的营收是多少";
        let stream = router
            .route(&intent(Intent::Financial, &[]), utterance, &history(utterance))
            .await;

        assert_eq!(
            transcript(stream).await,
            prompts::financial_context("revenue: 1.2B")
        );
    }

    #[tokio::test]
    async fn test_history_answer_sees_previous_turns() {
        let mut llm = MockLLMClient::new();
        llm.expect_stream_answer()
            .withf(|messages, _| messages.len() == 4)
            .returning(|_, _| Ok(scripted_answer(vec![PartialResult::transcript("你问了天气")])));
        let router = router(llm, MockWeatherBackend::new(), MockRetriever::new(), MockToolInvoker::new());

        let mut window = ConversationWindow::default();
        window.push_user("北京天气");
        window.push_assistant("晴");
        window.push_user("我刚才问了什么");
        assert_eq!(window.recent()[2].role, Role::User);

        let stream = router
            .route(&intent(Intent::ConversationHistory, &[]), "我刚才问了什么", &window.recent())
            .await;
        assert_eq!(transcript(stream).await, "你问了天气");
    }
}
