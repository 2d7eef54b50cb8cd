//! Configuration.
//!
//! One explicit `NlqConfig` value is built at startup (YAML file plus
//! environment overrides for secrets) and passed by reference into every
//! component constructor. No component reads ambient process state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NlqConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl NlqConfig {
    /// Load from a YAML file and apply environment overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Secrets and endpoints may come from the environment instead of
    /// the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("NLQ_LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(url) = std::env::var("NLQ_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Ok(url) = std::env::var("NLQ_ENGINE_BASE_URL") {
            self.engine.base_url = url;
        }
        if let Ok(key) = std::env::var("NLQ_ENGINE_API_KEY") {
            self.engine.api_key = Some(key);
        }
    }
}

/// Reasoning-service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API base URL; None means the public OpenAI endpoint.
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Query-engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub base_url: String,

    pub api_key: Option<String>,

    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout_secs: default_engine_timeout(),
            max_rows: default_max_rows(),
        }
    }
}

/// Workflow limits and arbitration thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Full pipeline passes per session before a hard failure.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Generation/validation/execution attempts per pass.
    #[serde(default = "default_max_sql_attempts")]
    pub max_sql_attempts: u32,

    #[serde(default = "default_max_correction_attempts")]
    pub max_correction_attempts: u32,

    /// Below this top heuristic confidence, join inference consults the
    /// reasoning service.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Proactively suspend when an unknown table term matches several
    /// catalog tables (off by default).
    #[serde(default)]
    pub proactive_ambiguity_check: bool,

    #[serde(default = "default_similar_table_threshold")]
    pub similar_table_threshold: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_sql_attempts: default_max_sql_attempts(),
            max_correction_attempts: default_max_correction_attempts(),
            confidence_threshold: default_confidence_threshold(),
            proactive_ambiguity_check: false,
            similar_table_threshold: default_similar_table_threshold(),
        }
    }
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Session-store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub base_path: PathBuf,

    /// Retention before terminal sessions are swept, bucketed by status.
    #[serde(default = "default_retention_completed")]
    pub retention_completed_days: i64,

    #[serde(default = "default_retention_failed")]
    pub retention_failed_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_storage_path(),
            retention_completed_days: default_retention_completed(),
            retention_failed_days: default_retention_failed(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_temperature() -> f32 {
    0.0
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_engine_timeout() -> u64 {
    300
}

fn default_max_rows() -> u64 {
    1000
}

fn default_max_iterations() -> u32 {
    5
}

fn default_max_sql_attempts() -> u32 {
    3
}

fn default_max_correction_attempts() -> u32 {
    3
}

fn default_confidence_threshold() -> f64 {
    0.75
}

fn default_similar_table_threshold() -> f64 {
    0.85
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".nlq/sessions")
}

fn default_retention_completed() -> i64 {
    30
}

fn default_retention_failed() -> i64 {
    90
}
