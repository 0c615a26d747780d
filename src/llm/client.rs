//! Chat-completion client.
//!
//! The pipeline only ever talks to [`LlmClient`]; the production
//! implementation speaks the OpenAI-compatible `/v1/chat/completions` API in
//! strict JSON mode.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::retry::{RetryPolicy, retry_transient};

use anyhow::Context as _;
use std::time::Duration;

/// A single system + user prompt exchange.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json_mode: true,
            max_tokens: None,
        }
    }
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Return the raw text of the model's reply.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Model identifier recorded alongside generated analyses.
    fn model_name(&self) -> &str;
}

pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build LLM HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": self.temperature,
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| LlmError::Timeout {
                secs: self.timeout.as_secs(),
            })?
            .map_err(|error| {
                if error.is_timeout() {
                    LlmError::Timeout {
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    LlmError::ProviderRequest(error.to_string())
                }
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|error| {
            LlmError::ProviderRequest(format!("failed to read response body: {error}"))
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&response_text)
                .ok()
                .and_then(|body| body["error"]["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| truncate_body(&response_text).to_string());
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        parse_chat_completion(&response_text)
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        retry_transient(&self.retry, "llm_completion", || self.attempt(&request)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Pull the assistant text out of a chat-completion response body.
fn parse_chat_completion(response_text: &str) -> Result<String> {
    let body: serde_json::Value = serde_json::from_str(response_text).map_err(|error| {
        LlmError::ProviderRequest(format!(
            "response is not valid JSON: {error}\nBody: {}",
            truncate_body(response_text)
        ))
    })?;

    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();

    if content.is_empty() {
        return Err(LlmError::EmptyResponse.into());
    }

    Ok(content.to_string())
}

fn truncate_body(body: &str) -> &str {
    let limit = 500;
    if body.len() <= limit {
        return body;
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_assistant_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":" {\"a\":1} "}}]}"#;
        assert_eq!(parse_chat_completion(body).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn empty_content_is_an_error() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":""}}]}"#;
        let error = parse_chat_completion(body).unwrap_err();
        assert!(error.to_string().contains("empty response"));
    }

    #[test]
    fn non_json_body_is_an_error() {
        assert!(parse_chat_completion("<html>bad gateway</html>").is_err());
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = LlmConfig::default();
        assert!(OpenAiCompatibleClient::new(&config).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let body = "é".repeat(400);
        let truncated = truncate_body(&body);
        assert!(truncated.len() <= 500);
        assert!(body.starts_with(truncated));
    }
}
