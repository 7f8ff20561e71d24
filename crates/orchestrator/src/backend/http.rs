use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{ChatMessage, ReasoningBackend};
use crate::config::BackendConfig;
use crate::error::{OrchestratorError, Result};

const DEFAULT_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30000;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// One failed request; `status` is `None` for transport errors.
#[derive(Debug)]
struct RequestFailure {
    status: Option<u16>,
    message: String,
}

impl RequestFailure {
    fn is_retryable(&self) -> bool {
        matches!(self.status, Some(code) if code == 429 || code >= 500)
    }
}

/// OpenAI-compatible `chat/completions` client.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Build from config, reading the API key from `api_key_env` if set.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => {
                    warn!(var = %var, "API key variable is not set, sending requests without auth");
                    None
                }
            },
            None => None,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            ..Self::new(config.base_url.clone(), config.model.clone(), api_key)
        })
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self
    }

    async fn chat_completion(&self, messages: &[ChatMessage]) -> std::result::Result<String, RequestFailure> {
        debug!(messages = messages.len(), model = %self.model, "Creating chat completion");

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| RequestFailure {
            status: None,
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(RequestFailure {
                status: Some(status.as_u16()),
                message,
            });
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| RequestFailure {
            status: None,
            message: format!("invalid completion body: {}", e),
        })?;

        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    async fn respond(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match self.chat_completion(messages).await {
                Ok(text) => return Ok(text),
                Err(failure) if failure.is_retryable() && retries < self.max_retries => {
                    warn!(
                        status = ?failure.status,
                        retry = retries + 1,
                        max_retries = self.max_retries,
                        "Chat completion failed, retrying in {}ms",
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    retries += 1;
                    backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
                }
                Err(failure) => {
                    error!(status = ?failure.status, message = %failure.message, "Chat completion failed");
                    return Err(OrchestratorError::backend(match failure.status {
                        Some(code) => format!("HTTP {}: {}", code, failure.message),
                        None => failure.message,
                    }));
                }
            }
        }
    }
}
