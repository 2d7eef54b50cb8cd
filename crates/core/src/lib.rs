//! NLQ Core - shared data model and external-interface seams
//!
//! Contains:
//! - Schema: relation catalog (tables, columns, join candidates)
//! - Phase: workflow state machine with a fixed transition table
//! - Session: durable per-request execution record
//! - Correction: typed user corrections and their parser
//! - LlmClient / QueryEngine: traits for the two unreliable collaborators
//! - NlqConfig: explicit configuration passed into every component

pub mod config;
pub mod correction;
pub mod engine;
pub mod error;
pub mod llm;
pub mod schema;
pub mod session;
pub mod state;

pub use config::{AgentConfig, ConfigError, EngineConfig, LlmConfig, NlqConfig, RetrySettings, StorageConfig};
pub use correction::{Correction, CorrectionKind};
pub use engine::{EngineError, ExecutionResult, QueryEngine, ValidationReport};
pub use error::{classify_text, Classify, ErrorClass};
pub use llm::{LlmClient, LlmError, Message, MessageRole};
pub use schema::{Column, ColumnType, JoinCandidate, Schema, Table};
pub use session::{
    AttemptResult, FailureSummary, Session, SessionMessage, SessionStatus, SqlAttempt,
};
pub use state::{InvalidTransition, Phase, PhaseStateMachine, PhaseTransition};
