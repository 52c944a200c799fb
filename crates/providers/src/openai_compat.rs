//! OpenAI-compatible chat completions provider.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/chat/completions`. Structured output is requested through
//! `response_format: {"type": "json_schema", ..}`.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use taskmind_config::ProviderConfig;
use taskmind_core::error::ProviderError;
use taskmind_core::provider::{LanguageModel, ModelRequest, ModelResponse, Usage};
use tracing::{debug, warn};

/// An OpenAI-compatible language model.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client: http_client()?,
        })
    }

    /// Build from the `[provider]` config section. Requires an API key.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(
                "no API key; set TASKMIND_API_KEY or provider.api_key".into(),
            )
        })?;
        Self::new("openai", &config.api_url, api_key, &config.model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &ModelRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": request.system}));
        }
        for m in &request.messages {
            messages.push(serde_json::json!({"role": m.role.as_str(), "content": m.content}));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": false,
        });

        if let Some(schema) = &request.schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true,
                },
            });
        }
        body
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let response = check_status(response).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

        let mut result = ModelResponse::from_text(
            choice.message.content.unwrap_or_default(),
            api_response.model.unwrap_or_else(|| self.model.clone()),
        );
        result.usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        Ok(result)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, self.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!("{}s", timeout.as_secs_f32()))),
        }
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {e}")))
}

/// Map non-success statuses onto the provider error taxonomy.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();

    if status == 429 {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(5);
        return Err(ProviderError::RateLimited { retry_after_secs });
    }

    if status == 401 || status == 403 {
        return Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ));
    }

    if status != 200 {
        let error_body = response.text().await.unwrap_or_default();
        warn!(status, body = %error_body, "Provider returned error");
        return Err(ProviderError::ApiError {
            status_code: status,
            message: error_body,
        });
    }

    Ok(response)
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmind_core::provider::{PromptMessage, ResponseSchema};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(uri: &str) -> OpenAiCompatProvider {
        OpenAiCompatProvider::new("test", uri, "sk-test", "gpt-test").unwrap()
    }

    fn request() -> ModelRequest {
        ModelRequest::new(
            "You extract tasks.",
            vec![PromptMessage::user("Send the report")],
            Duration::from_secs(5),
        )
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "model": "gpt-test",
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        })
    }

    #[test]
    fn body_includes_system_and_schema() {
        let p = provider("http://localhost");
        let req = request().with_schema(ResponseSchema {
            name: "task".into(),
            schema: serde_json::json!({"type": "object"}),
        });
        let body = p.request_body(&req);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Send the report");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "task");
    }

    #[test]
    fn from_config_requires_key() {
        let config = ProviderConfig::default();
        assert!(matches!(
            OpenAiCompatProvider::from_config(&config),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn structured_completion_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-test"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(r#"{"has_task": true}"#)))
            .mount(&server)
            .await;

        let resp = provider(&server.uri()).invoke(request()).await.unwrap();
        assert_eq!(resp.structured.unwrap()["has_task"], true);
        assert_eq!(resp.usage.unwrap().total_tokens, 16);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).invoke(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { retry_after_secs: 7 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn auth_failure_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).invoke(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).invoke(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ApiError { status_code: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("late"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let mut req = request();
        req.timeout = Duration::from_millis(50);
        let err = provider(&server.uri()).invoke(req).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }
}
