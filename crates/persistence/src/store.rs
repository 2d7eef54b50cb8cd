//! Storage abstraction for sessions.

use chrono::{DateTime, Utc};
use nlq_core::{Session, SessionStatus};
use serde::{Deserialize, Serialize};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Lightweight listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub query: String,
    pub status: SessionStatus,
}

/// Retention ages (days) for the terminal status buckets. Non-terminal
/// sessions are never swept.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed_days: i64,
    pub failed_days: i64,
}

impl From<&nlq_core::StorageConfig> for RetentionPolicy {
    fn from(config: &nlq_core::StorageConfig) -> Self {
        Self {
            completed_days: config.retention_completed_days,
            failed_days: config.retention_failed_days,
        }
    }
}

/// Durable session store.
///
/// `save` is an idempotent full overwrite with last-writer-wins semantics;
/// concurrent resumption of a single session id is unsupported.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session for a request and persist it immediately.
    async fn create(&self, query: &str) -> Result<Session>;

    /// Persist a complete snapshot of the session.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Load a session by id.
    async fn load(&self, session_id: &str) -> Result<Session>;

    /// List sessions, newest first, optionally filtered by status.
    async fn list(
        &self,
        status_filter: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>>;

    /// Delete a session. Deleting an absent session is not an error.
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Delete terminal sessions older than the policy allows.
    /// Returns the number of sessions removed.
    async fn cleanup(&self, policy: RetentionPolicy) -> Result<usize>;
}
