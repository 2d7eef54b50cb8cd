//! Generic REST binding for a remote query engine.
//!
//! Posts statements to a single endpoint; `dry_run` selects validation.
//! The wire format mirrors what warehouse proxies commonly expose:
//! `{ok, rows?, row_count?, bytes_scanned?, error?, error_type?}`.

use super::{EngineError, ExecutionResult, QueryEngine, ValidationReport};
use crate::config::EngineConfig;
use crate::error::{classify_text, ErrorClass};
use reqwest::{Client, StatusCode};
use serde_json::json;

#[derive(Clone)]
pub struct HttpQueryEngine {
    config: EngineConfig,
    client: Client,
}

impl std::fmt::Debug for HttpQueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQueryEngine")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpQueryEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Internal {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { config, client })
    }

    async fn post_query(
        &self,
        sql: &str,
        dry_run: bool,
        max_rows: Option<u64>,
    ) -> Result<serde_json::Value, EngineError> {
        let url = format!("{}/query", self.config.base_url.trim_end_matches('/'));

        let mut request = self.client.post(&url).json(&json!({
            "sql": sql,
            "dry_run": dry_run,
            "max_rows": max_rows,
        }));
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout {
                    seconds: self.config.timeout_secs,
                }
            } else {
                EngineError::Network { source: e }
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EngineError::PermissionDenied {
                message: format!("engine returned status {}", status),
            });
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::QuotaExceeded {
                message: "engine rate limit".to_string(),
            });
        } else if status.is_server_error() {
            return Err(EngineError::Unavailable {
                message: format!("engine returned status {}", status),
            });
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| EngineError::Internal {
                message: format!("failed to parse engine response: {}", e),
            })?;

        if body["ok"].as_bool().unwrap_or(false) {
            return Ok(body);
        }

        let message = body["error"].as_str().unwrap_or("unknown error").to_string();
        Err(match body["error_type"].as_str() {
            Some("permission") => EngineError::PermissionDenied { message },
            Some("timeout") => EngineError::Timeout {
                seconds: self.config.timeout_secs,
            },
            Some("quota") => EngineError::QuotaExceeded { message },
            // Statement-level rejections report as invalid query.
            Some("syntax") | Some("invalid") => EngineError::InvalidQuery { message },
            // No structured code: fall back to text classification.
            None => match classify_text(&message) {
                ErrorClass::Recoverable => EngineError::Unavailable { message },
                ErrorClass::Fatal => EngineError::InvalidQuery { message },
            },
            Some(other) => EngineError::Internal {
                message: format!("{} ({})", message, other),
            },
        })
    }
}

#[async_trait::async_trait]
impl QueryEngine for HttpQueryEngine {
    async fn validate(&self, sql: &str) -> Result<ValidationReport, EngineError> {
        tracing::debug!(sql_prefix = sql.get(..120).unwrap_or(sql), "validating statement");
        let body = self.post_query(sql, true, None).await?;
        Ok(ValidationReport {
            bytes_scanned: body["bytes_scanned"].as_u64().unwrap_or(0),
        })
    }

    async fn execute(
        &self,
        sql: &str,
        max_rows: Option<u64>,
    ) -> Result<ExecutionResult, EngineError> {
        let max_rows = max_rows.or(Some(self.config.max_rows));
        tracing::info!(sql_prefix = sql.get(..120).unwrap_or(sql), "executing statement");

        let body = self.post_query(sql, false, max_rows).await?;
        let rows = body["rows"].as_array().cloned().unwrap_or_default();
        let row_count = body["row_count"].as_u64().unwrap_or(rows.len() as u64);

        Ok(ExecutionResult {
            row_count,
            bytes_scanned: body["bytes_scanned"].as_u64().unwrap_or(0),
            rows,
        })
    }
}
