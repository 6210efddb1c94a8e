//! Chat-completion and embedding provider client.
//!
//! Speaks the OpenAI-compatible HTTP surface of the GLM API: `POST
//! {base}/chat/completions` and `POST {base}/embeddings` with a bearer
//! token. Responses carry either a `choices` array or an `error`
//! object. Transient failures retry up to three times with exponential
//! delay.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{Error, Result};

pub const DEFAULT_GLM_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
pub const DEFAULT_CHAT_MODEL: &str = "glm-4";
pub const DEFAULT_EMBEDDING_MODEL: &str = "embedding-3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One turn in a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Chat completion request body.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Chat completion response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

impl ChatResponse {
    /// Text of the first candidate, if the model produced one.
    pub fn first_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ApiError>,
}

/// Common interface over chat-and-embedding providers, kept narrow so
/// tests can substitute scripted models.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Request a chat completion.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;
}

/// GLM API client.
pub struct GlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    embedding_model: String,
    retry: RetryPolicy,
}

impl GlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            chat_model: DEFAULT_CHAT_MODEL.into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let envelope: ErrorEnvelope = serde_json::from_slice(&bytes).unwrap_or_default();
            let detail = envelope
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            let msg = if status.as_u16() == 429 {
                format!("rate limit: {detail}")
            } else {
                format!("HTTP {status}: {detail}")
            };
            return Err(Error::Upstream(msg));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn chat_once(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let mut req = req.clone();
        if req.model.is_empty() {
            req.model = self.chat_model.clone();
        }
        let resp: ChatResponse = self.post_json("/chat/completions", &req).await?;
        if let Some(error) = &resp.error {
            return Err(Error::Upstream(error.message.clone()));
        }
        Ok(resp)
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        let req = EmbeddingRequest {
            input: texts,
            model: &self.embedding_model,
        };
        let resp: EmbeddingResponse = self.post_json("/embeddings", &req).await?;
        if let Some(error) = resp.error {
            return Err(Error::Upstream(error.message));
        }
        let mut data = resp.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl LanguageModel for GlmClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.retry.run(|| self.chat_once(req)).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.retry.run(|| self.embed_once(texts)).await
    }
}
