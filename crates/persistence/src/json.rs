//! JSON file storage implementation.
//!
//! One `<session_id>.json` file per session under a base directory.
//! Writes go to a temp file first and are renamed into place, so a crash
//! mid-write never leaves a truncated session on disk.

use crate::store::{Result, RetentionPolicy, SessionStore, SessionSummary, StoreError};
use chrono::{Duration, Utc};
use nlq_core::{Session, SessionStatus};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    root: PathBuf,
}

impl JsonSessionStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        info!(path = %root.display(), "session store initialized");
        Ok(Self { root })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", session_id))
    }

    async fn load_file(path: &Path) -> Result<Session> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(StoreError::Serialize)
    }

    async fn write_atomic(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.session_id);
        let content = serde_json::to_string_pretty(session).map_err(StoreError::Serialize)?;

        // Write to a temp file, then rename into place (atomic on the
        // same filesystem).
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    /// All session files with their modified times, newest first.
    async fn session_files(&self) -> Result<Vec<(PathBuf, std::time::SystemTime)>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .await?
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }

        files.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(files)
    }
}

#[async_trait::async_trait]
impl SessionStore for JsonSessionStore {
    async fn create(&self, query: &str) -> Result<Session> {
        let session = Session::new(query);
        self.write_atomic(&session).await?;
        info!(session_id = %session.session_id, "created session");
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.write_atomic(session).await?;
        debug!(session_id = %session.session_id, "saved session");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Session> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        let session = Self::load_file(&path).await?;
        info!(session_id = %session_id, "loaded session");
        Ok(session)
    }

    async fn list(
        &self,
        status_filter: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();

        for (path, _) in self.session_files().await? {
            let session = match Self::load_file(&path).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                    continue;
                }
            };

            if let Some(filter) = status_filter {
                if session.status() != filter {
                    continue;
                }
            }

            summaries.push(SessionSummary {
                session_id: session.session_id.clone(),
                created_at: session.created_at,
                last_updated: session.last_updated,
                query: session.original_query.clone(),
                status: session.status(),
            });

            if summaries.len() >= limit {
                break;
            }
        }

        Ok(summaries)
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        if !path.exists() {
            warn!(session_id = %session_id, "session not found for deletion");
            return Ok(());
        }

        tokio::fs::remove_file(&path).await?;
        info!(session_id = %session_id, "deleted session");
        Ok(())
    }

    async fn cleanup(&self, policy: RetentionPolicy) -> Result<usize> {
        let now = Utc::now();
        let mut deleted = 0;

        for (path, _) in self.session_files().await? {
            let session = match Self::load_file(&path).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                    continue;
                }
            };

            let retention_days = match session.status() {
                SessionStatus::Completed => policy.completed_days,
                SessionStatus::Failed => policy.failed_days,
                _ => continue,
            };

            if session.last_updated < now - Duration::days(retention_days) {
                tokio::fs::remove_file(&path).await?;
                deleted += 1;
                info!(session_id = %session.session_id, "deleted expired session");
            }
        }

        if deleted > 0 {
            info!(count = deleted, "retention sweep removed sessions");
        }

        Ok(deleted)
    }
}
