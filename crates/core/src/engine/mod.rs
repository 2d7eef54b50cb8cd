//! Query-engine abstraction.
//!
//! The engine validates (side-effect-free dry run) and executes SQL
//! statements. Errors are typed so the retry layer can classify them
//! without inspecting message text.

pub mod http;

pub use http::HttpQueryEngine;

use crate::error::{Classify, ErrorClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-facing errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("query timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("engine unavailable: {message}")]
    Unavailable { message: String },

    #[error("network error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("engine error: {message}")]
    Internal { message: String },
}

impl Classify for EngineError {
    fn classify(&self) -> ErrorClass {
        match self {
            EngineError::Timeout { .. }
            | EngineError::QuotaExceeded { .. }
            | EngineError::Unavailable { .. } => ErrorClass::Recoverable,
            EngineError::Network { source } => {
                if source.is_timeout() || source.is_connect() {
                    ErrorClass::Recoverable
                } else {
                    ErrorClass::Fatal
                }
            }
            // Statement and permission faults cannot be fixed by retrying,
            // and unknown engine faults fail closed.
            EngineError::PermissionDenied { .. }
            | EngineError::InvalidQuery { .. }
            | EngineError::Internal { .. } => ErrorClass::Fatal,
        }
    }
}

impl EngineError {
    /// Whether refining the statement could plausibly fix this failure.
    /// Transport-level faults are not statement problems.
    pub fn is_statement_fault(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidQuery { .. } | EngineError::PermissionDenied { .. }
        )
    }
}

/// Result of a dry-run validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub bytes_scanned: u64,
}

/// Result of executing a statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rows: Vec<serde_json::Value>,
    pub row_count: u64,
    pub bytes_scanned: u64,
}

/// Remote query engine. `validate` is side-effect-free.
#[async_trait::async_trait]
pub trait QueryEngine: Send + Sync {
    async fn validate(&self, sql: &str) -> Result<ValidationReport, EngineError>;

    async fn execute(
        &self,
        sql: &str,
        max_rows: Option<u64>,
    ) -> Result<ExecutionResult, EngineError>;
}
