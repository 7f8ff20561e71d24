//! Reasoning backend capability: ordered chat messages in, text out.

mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

pub use http::HttpBackend;

/// Role in a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn respond(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[async_trait]
impl<T: ReasoningBackend + ?Sized> ReasoningBackend for Arc<T> {
    async fn respond(&self, messages: &[ChatMessage]) -> Result<String> {
        (**self).respond(messages).await
    }
}

/// Retries empty or failed responses a bounded number of times.
///
/// The final failure is always reported as [`OrchestratorError::Backend`].
pub struct RetryingBackend<B> {
    inner: B,
    retries: u32,
}

impl<B: ReasoningBackend> RetryingBackend<B> {
    pub fn new(inner: B, retries: u32) -> Self {
        Self { inner, retries }
    }
}

#[async_trait]
impl<B: ReasoningBackend> ReasoningBackend for RetryingBackend<B> {
    async fn respond(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut last_error = String::from("empty response");

        for attempt in 0..=self.retries {
            match self.inner.respond(messages).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => {
                    debug!(attempt, "Backend returned empty text");
                    last_error = "empty response".to_string();
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Backend call failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(OrchestratorError::backend(format!(
            "{} after {} attempts",
            last_error,
            self.retries + 1
        )))
    }
}
