//! Model contracts: the language model and the embedding function.
//!
//! Both are consumed through narrow traits. The chat path and the task
//! detection pipeline call [`LanguageModel::invoke`] without knowing which
//! backend answers; the memory index calls [`Embedder::embed`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProviderError;
use crate::message::Role;

/// One message of a model request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// A JSON schema the model's output must conform to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    /// Schema name sent to the provider
    pub name: String,

    /// JSON Schema document
    pub schema: serde_json::Value,
}

/// A single model invocation: `invoke(prompt, schema, timeout)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// System prompt
    pub system: String,

    /// Conversation messages, oldest first
    pub messages: Vec<PromptMessage>,

    /// Structured-output schema; `None` for free text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ResponseSchema>,

    /// Temperature (0.0 = deterministic)
    #[serde(default)]
    pub temperature: f32,

    /// Per-call timeout
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, messages: Vec<PromptMessage>, timeout: Duration) -> Self {
        Self {
            system: system.into(),
            messages,
            schema: None,
            temperature: 0.0,
            timeout,
        }
    }

    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The model's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Raw text content
    pub text: String,

    /// Parsed JSON when the request carried a schema and the text parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,

    /// Which model actually responded
    pub model: String,

    /// Token usage statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ModelResponse {
    /// A text-only response; `structured` is filled if the text is JSON.
    pub fn from_text(text: impl Into<String>, model: impl Into<String>) -> Self {
        let text = text.into();
        let structured = serde_json::from_str(text.trim()).ok();
        Self {
            text,
            structured,
            model: model.into(),
            usage: None,
        }
    }
}

/// The language model contract.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// A human-readable name for this backend (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    ///
    /// Implementations honour `request.timeout` and fail with
    /// [`ProviderError::Timeout`] when it elapses.
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError>;
}

/// The embedding function contract: text → fixed-length vector.
///
/// Must be deterministic for identical input, including across restarts.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
