//! Document retrieval for knowledge-base answers.

use crate::error::BackendError;
use async_openai::{Client, config::OpenAIConfig, types::CreateEmbeddingRequestArgs};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Finds documents relevant to a question.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Returns the contents of up to `top_k` documents, best match first.
    async fn retrieve(&self, question: &str, top_k: usize) -> Result<Vec<String>, BackendError>;
}

/// A retriever with no document store; answers fall back to history alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyRetriever;

#[async_trait]
impl Retriever for EmptyRetriever {
    async fn retrieve(&self, _question: &str, _top_k: usize) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct MatchedDocument {
    content: String,
    #[serde(default)]
    similarity: Option<f64>,
}

/// Vector search over a Supabase table through its `match_documents` RPC.
pub struct SupabaseRetriever {
    embeddings: Client<OpenAIConfig>,
    embedding_model: String,
    http: reqwest::Client,
    rpc_url: String,
    api_key: String,
    table: String,
    match_threshold: f32,
}

impl SupabaseRetriever {
    pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.3;

    /// # Arguments
    ///
    /// * `llm_config` - OpenAI-compatible endpoint used for embeddings.
    /// * `embedding_model` - Embedding model identifier.
    /// * `supabase_url` - Project URL, e.g. `https://xyz.supabase.co`.
    /// * `api_key` - Supabase service or anon key.
    /// * `table` - Table searched by the RPC.
    pub fn new(
        llm_config: OpenAIConfig,
        embedding_model: impl Into<String>,
        supabase_url: &str,
        api_key: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            embeddings: Client::with_config(llm_config),
            embedding_model: embedding_model.into(),
            http,
            rpc_url: format!(
                "{}/rest/v1/rpc/match_documents",
                supabase_url.trim_end_matches('/')
            ),
            api_key: api_key.into(),
            table: table.into(),
            match_threshold: Self::DEFAULT_MATCH_THRESHOLD,
        }
    }

    async fn embed(&self, question: &str) -> Result<Vec<f32>, BackendError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .input(question)
            .build()
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        let response = self
            .embeddings
            .embeddings()
            .create(request)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        response
            .data
            .into_iter()
            .next()
            .map(|embedding| embedding.embedding)
            .ok_or_else(|| BackendError::Malformed("embedding response had no data".into()))
    }
}

#[async_trait]
impl Retriever for SupabaseRetriever {
    async fn retrieve(&self, question: &str, top_k: usize) -> Result<Vec<String>, BackendError> {
        let started = Instant::now();
        let embedding = self.embed(question).await?;
        debug!(dimensions = embedding.len(), "Embedded question");

        let response = self
            .http
            .post(&self.rpc_url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "query_embedding": embedding,
                "match_threshold": self.match_threshold,
                "match_count": top_k,
                "table_name": self.table,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!("HTTP {status}")));
        }
        let body = response.text().await?;
        let documents: Vec<MatchedDocument> =
            serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))?;

        info!(
            matches = documents.len(),
            best = documents.first().and_then(|d| d.similarity),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Retrieved documents"
        );
        Ok(documents
            .into_iter()
            .take(top_k)
            .map(|d| d.content)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    async fn mock_embeddings(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{ "object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3] }],
                "model": "text-embedding-v1",
                "usage": { "prompt_tokens": 4, "total_tokens": 4 }
            })))
            .mount(server)
            .await;
    }

    fn retriever(server: &MockServer) -> SupabaseRetriever {
        let llm_config = OpenAIConfig::new()
            .with_api_base(server.uri())
            .with_api_key("llm-key");
        SupabaseRetriever::new(llm_config, "text-embedding-v1", &server.uri(), "sb-key", "testdoc")
    }

    #[tokio::test]
    async fn test_retrieve_embeds_and_calls_match_documents() {
        let server = MockServer::start().await;
        mock_embeddings(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/match_documents"))
            .and(header("apikey", "sb-key"))
            .and(body_partial_json(json!({ "match_count": 2, "table_name": "testdoc" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 1, "content": "年假每年十天", "similarity": 0.82 },
                { "id": 2, "content": "病假需提供证明", "similarity": 0.61 }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let documents = retriever(&server).retrieve("年假有几天", 2).await.unwrap();
        assert_eq!(documents, vec!["年假每年十天", "病假需提供证明"]);
    }

    #[tokio::test]
    async fn test_rpc_failure_is_unavailable() {
        let server = MockServer::start().await;
        mock_embeddings(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/match_documents"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = retriever(&server).retrieve("年假有几天", 3).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_empty_retriever_finds_nothing() {
        assert!(EmptyRetriever.retrieve("anything", 3).await.unwrap().is_empty());
    }
}
