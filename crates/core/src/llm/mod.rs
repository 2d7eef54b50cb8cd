//! Reasoning-service abstraction.
//!
//! Responsibilities:
//! - Unified client trait for all LLM backends
//! - Common message types
//! - Typed errors with recoverable/fatal classification

pub mod openai;

pub use openai::OpenAiCompatibleClient;

use crate::error::{Classify, ErrorClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client-facing errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API error: {message}")]
    Api {
        message: String,
        status_code: Option<u16>,
    },

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("network error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("malformed response: {message}")]
    InvalidResponse { message: String },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("retry attempts exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },
}

impl Classify for LlmError {
    fn classify(&self) -> ErrorClass {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } => ErrorClass::Recoverable,
            LlmError::Network { source } => {
                if source.is_timeout() || source.is_connect() {
                    ErrorClass::Recoverable
                } else {
                    ErrorClass::Fatal
                }
            }
            LlmError::Api { status_code, .. } => match status_code {
                Some(code) if *code >= 500 => ErrorClass::Recoverable,
                // 4xx and codeless API errors fail closed.
                _ => ErrorClass::Fatal,
            },
            LlmError::Auth { .. }
            | LlmError::InvalidRequest { .. }
            | LlmError::InvalidResponse { .. }
            | LlmError::InvalidConfig { .. }
            | LlmError::RetryExhausted { .. } => ErrorClass::Fatal,
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "tool")]
    Tool,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Reasoning-service client.
///
/// `complete` returns free text; `complete_structured` forces the response
/// into the supplied JSON schema and returns the parsed value.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
    ) -> Result<String, LlmError>;

    async fn complete_structured(
        &self,
        schema: &serde_json::Value,
        messages: &[Message],
    ) -> Result<serde_json::Value, LlmError>;
}
