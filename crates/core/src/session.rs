//! Session - one durable record per user request lifecycle.
//!
//! Responsibilities:
//! - Track the conversation, identified tables, inferred joins, and every
//!   SQL attempt across the workflow
//! - Accumulate hard constraints derived from user corrections
//! - Own the phase state machine and derive a status from it
//!
//! The session id never changes after creation. Serialization is a
//! complete, order-preserving snapshot; partial snapshots would break
//! resumability.

use crate::correction::Correction;
use crate::llm::MessageRole;
use crate::schema::JoinCandidate;
use crate::state::{Phase, PhaseStateMachine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Derived session status, computed purely from the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Interrupted,
    AwaitingCorrection,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::AwaitingCorrection => "awaiting_correction",
        };
        f.write_str(name)
    }
}

/// One entry in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Summary of a successful execution attached to an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub row_count: u64,
    pub bytes_scanned: u64,
}

/// One generation/validation/execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlAttempt {
    pub sql: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<AttemptResult>,
    pub timestamp: DateTime<Utc>,
    /// Workflow iteration this attempt belongs to.
    pub iteration: u32,
}

/// Structured summary persisted with every terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSummary {
    pub user_query: String,
    pub identified_tables: Vec<String>,
    pub attempted_iterations: u32,
    pub correction_attempts: u32,
    pub error: String,
    pub sql_attempts: usize,
    pub recommendations: Vec<String>,
}

/// Full execution record for one user request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    pub original_query: String,
    /// Catalog snapshot taken when the session was created.
    #[serde(default)]
    pub schema_snapshot: Option<serde_json::Value>,

    pub messages: Vec<SessionMessage>,
    pub state_machine: PhaseStateMachine,

    pub iteration_count: u32,
    pub correction_attempt: u32,

    pub identified_tables: Vec<String>,
    pub inferred_joins: Vec<JoinCandidate>,

    pub corrections: Vec<Correction>,
    pub hard_constraints: Vec<String>,

    pub sql_attempts: Vec<SqlAttempt>,
    #[serde(default)]
    pub failure_summary: Option<FailureSummary>,
}

impl Session {
    pub fn new(query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_updated: now,
            original_query: query.into(),
            schema_snapshot: None,
            messages: Vec::new(),
            state_machine: PhaseStateMachine::new(),
            iteration_count: 0,
            correction_attempt: 0,
            identified_tables: Vec::new(),
            inferred_joins: Vec::new(),
            corrections: Vec::new(),
            hard_constraints: Vec::new(),
            sql_attempts: Vec::new(),
            failure_summary: None,
        }
    }

    /// Status derived from the current phase.
    pub fn status(&self) -> SessionStatus {
        match self.state_machine.current() {
            Phase::Completed => SessionStatus::Completed,
            Phase::Failed => SessionStatus::Failed,
            Phase::Interrupted => SessionStatus::Interrupted,
            Phase::AwaitingCorrection => SessionStatus::AwaitingCorrection,
            _ => SessionStatus::Active,
        }
    }

    /// SQL from the most recent successful attempt, if any.
    pub fn final_sql(&self) -> Option<&str> {
        self.sql_attempts
            .iter()
            .rev()
            .find(|a| a.success)
            .map(|a| a.sql.as_str())
    }

    pub fn add_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(SessionMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        });
        self.touch();
    }

    /// Record an attempt; the current iteration number is stamped
    /// automatically.
    pub fn add_sql_attempt(
        &mut self,
        sql: impl Into<String>,
        success: bool,
        error: Option<String>,
        result: Option<AttemptResult>,
    ) {
        self.sql_attempts.push(SqlAttempt {
            sql: sql.into(),
            success,
            error,
            result,
            timestamp: Utc::now(),
            iteration: self.iteration_count,
        });
        self.touch();
    }

    /// Append a correction, stamping its attempt number and deriving its
    /// constraint string onto the hard-constraint list.
    pub fn add_correction(&mut self, mut correction: Correction) {
        correction.attempt_number = self.correction_attempt;
        let constraint = correction.to_constraint_string();
        tracing::info!(
            session_id = %self.session_id,
            constraint = %constraint,
            "added correction"
        );
        self.hard_constraints.push(constraint);
        self.corrections.push(correction);
        self.touch();
    }

    pub fn increment_iteration(&mut self) {
        self.iteration_count += 1;
        self.touch();
    }

    pub fn increment_correction_attempt(&mut self) {
        self.correction_attempt += 1;
        self.touch();
    }

    pub fn set_failure_summary(&mut self, summary: FailureSummary) {
        self.failure_summary = Some(summary);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}
