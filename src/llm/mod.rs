//! Model and retrieval seams used by the governed AI pipelines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::config::LlmConfig;
use crate::core::error::GovernanceError;
use crate::core::session::SessionContext;

pub mod copilot;
pub mod governed;
pub mod provenance;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn model_id(&self) -> &str;

    async fn generate(&self, prompt: &str, config: &Value) -> Result<String, GovernanceError>;
}

/// A knowledge-base passage offered as prompt context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub score: f64,
    pub text: String,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Passages visible to `ctx`'s tenant, best first.
    async fn retrieve(
        &self,
        ctx: &SessionContext,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, GovernanceError>;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAIClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAIClient {
    pub fn new(base_url: &str, config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model_id.clone(),
            max_tokens: config.max_tokens,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config))
    }
}

#[async_trait]
impl LLMProvider for OpenAIClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, config: &Value) -> Result<String, GovernanceError> {
        let max_tokens = config
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(self.max_tokens));
        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": max_tokens,
                "temperature": config.get("temperature").cloned().unwrap_or(json!(0.2)),
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GovernanceError::Llm(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GovernanceError::Llm(format!("completion endpoint returned {status}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GovernanceError::Llm(e.to_string()))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GovernanceError::Llm("completion without content".into()))
    }
}
