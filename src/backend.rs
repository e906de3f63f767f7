//! Inference backend clients.
//!
//! [`InferenceBackend`] is the seam the router calls through; the production
//! implementation is [`HttpBackend`], an OpenAI-compatible chat-completions
//! client. Tests substitute scripted implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{RouteError, RouteResult};

/// Completed response from a backend.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub content: String,
    /// Prompt + completion tokens, when the provider reports usage.
    pub tokens: u64,
    /// Actual cost in USD when the provider reports it; the router falls back
    /// to the selection's estimate otherwise.
    pub reported_cost: Option<f64>,
}

/// A single inference backend client.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// One completion attempt. No retries here; the router owns retry policy.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u64,
    ) -> RouteResult<BackendResponse>;
}

/// Maps backend ids to their clients.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, backend_id: impl Into<String>, client: Arc<dyn InferenceBackend>) -> Self {
        self.backends.insert(backend_id.into(), client);
        self
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<dyn InferenceBackend>> {
        self.backends.get(backend_id).cloned()
    }
}

/// OpenAI-compatible HTTP backend.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Parse Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u64,
    ) -> RouteResult<BackendResponse> {
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens,
        };

        tracing::debug!(backend = model, "sending chat completion request");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    format!("request timeout: {}", e)
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    format!("request failed: {}", e)
                };
                RouteError::BackendCallFailed {
                    backend: model.to_string(),
                    reason,
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let reason = match retry_after {
                Some(after) => format!("HTTP {} (retry after {:?}): {}", status, after, body),
                None => format!("HTTP {}: {}", status, body),
            };
            return Err(RouteError::BackendCallFailed {
                backend: model.to_string(),
                reason,
            });
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| RouteError::BackendCallFailed {
                backend: model.to_string(),
                reason: format!("unparseable response: {}", e),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RouteError::BackendCallFailed {
                backend: model.to_string(),
                reason: "no choices in response".to_string(),
            })?;

        let tokens = parsed
            .usage
            .as_ref()
            .map(|u| u.prompt_tokens + u.completion_tokens)
            .unwrap_or(0);

        Ok(BackendResponse {
            content: choice.message.content.unwrap_or_default(),
            tokens,
            reported_cost: parsed.usage.and_then(|u| u.cost),
        })
    }
}

/// OpenAI-compatible request format.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// OpenAI-compatible response format.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    /// Some routers (e.g. OpenRouter) report the request cost directly.
    #[serde(default)]
    cost: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        struct Stub;
        #[async_trait]
        impl InferenceBackend for Stub {
            async fn generate(&self, _: &str, _: &str, _: u64) -> RouteResult<BackendResponse> {
                Ok(BackendResponse {
                    content: "ok".into(),
                    tokens: 1,
                    reported_cost: None,
                })
            }
        }

        let registry = BackendRegistry::new().register("a", Arc::new(Stub));
        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn response_parsing_shape() {
        let body = r#"{
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "cost": 0.0003}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens + usage.completion_tokens, 15);
        assert_eq!(usage.cost, Some(0.0003));
    }
}
