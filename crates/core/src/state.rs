//! Workflow phase state machine.
//!
//! Responsibilities:
//! - Enforce the fixed directed graph of legal phase transitions
//! - Record every transition with timestamp, reason, and metadata
//!
//! The successor table is fixed data and identical for every instance, so
//! persisted transition histories stay replayable against any build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A discrete step of the orchestration pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    SchemaLoading,
    QueryUnderstanding,
    JoinInference,
    ExecutingExploration,
    GeneratingSql,
    ExecutingQuery,
    AwaitingCorrection,
    Completed,
    Failed,
    Interrupted,
}

impl Phase {
    /// Legal successor phases. `Completed` and `Failed` are terminal.
    pub fn successors(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Initializing => &[SchemaLoading, Failed, Interrupted],
            SchemaLoading => &[QueryUnderstanding, Failed, Interrupted],
            QueryUnderstanding => &[
                JoinInference,
                ExecutingExploration,
                GeneratingSql,
                AwaitingCorrection,
                Failed,
                Interrupted,
            ],
            JoinInference => &[
                ExecutingExploration,
                GeneratingSql,
                AwaitingCorrection,
                Failed,
                Interrupted,
            ],
            ExecutingExploration => &[
                JoinInference,
                GeneratingSql,
                AwaitingCorrection,
                Failed,
                Interrupted,
            ],
            GeneratingSql => &[ExecutingQuery, AwaitingCorrection, Failed, Interrupted],
            ExecutingQuery => &[
                Completed,
                GeneratingSql,
                AwaitingCorrection,
                Failed,
                Interrupted,
            ],
            AwaitingCorrection => &[QueryUnderstanding, Failed, Interrupted],
            Completed => &[],
            Failed => &[],
            // Resumption may re-enter any pipeline phase.
            Interrupted => &[
                SchemaLoading,
                QueryUnderstanding,
                JoinInference,
                ExecutingExploration,
                GeneratingSql,
                ExecutingQuery,
            ],
        }
    }

    pub fn all() -> &'static [Phase] {
        use Phase::*;
        &[
            Initializing,
            SchemaLoading,
            QueryUnderstanding,
            JoinInference,
            ExecutingExploration,
            GeneratingSql,
            ExecutingQuery,
            AwaitingCorrection,
            Completed,
            Failed,
            Interrupted,
        ]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::SchemaLoading => "schema_loading",
            Phase::QueryUnderstanding => "query_understanding",
            Phase::JoinInference => "join_inference",
            Phase::ExecutingExploration => "executing_exploration",
            Phase::GeneratingSql => "generating_sql",
            Phase::ExecutingQuery => "executing_query",
            Phase::AwaitingCorrection => "awaiting_correction",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Attempted transition to a phase outside the current successor set.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid phase transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Current phase plus the full ordered transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStateMachine {
    current: Phase,
    transitions: Vec<PhaseTransition>,
}

impl Default for PhaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseStateMachine {
    pub fn new() -> Self {
        Self::with_phase(Phase::Initializing)
    }

    /// Start from an arbitrary phase (used when restoring sessions).
    pub fn with_phase(phase: Phase) -> Self {
        Self {
            current: phase,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn can_transition(&self, target: Phase) -> bool {
        self.current.successors().contains(&target)
    }

    /// Move to `target`, appending a transition record.
    ///
    /// On failure the current phase is unchanged and no record is appended.
    pub fn transition_to(
        &mut self,
        target: Phase,
        reason: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<(), InvalidTransition> {
        if !self.can_transition(target) {
            return Err(InvalidTransition {
                from: self.current,
                to: target,
            });
        }

        self.transitions.push(PhaseTransition {
            from: self.current,
            to: target,
            timestamp: Utc::now(),
            reason,
            metadata,
        });
        self.current = target;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.current, Phase::Completed | Phase::Failed)
    }

    pub fn is_awaiting_input(&self) -> bool {
        matches!(
            self.current,
            Phase::AwaitingCorrection | Phase::Interrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(sm: &mut PhaseStateMachine, to: Phase) -> Result<(), InvalidTransition> {
        sm.transition_to(to, Some("test".to_string()), HashMap::new())
    }

    #[test]
    fn test_initial_phase() {
        let sm = PhaseStateMachine::new();
        assert_eq!(sm.current(), Phase::Initializing);
        assert!(sm.transitions().is_empty());
        assert!(!sm.is_terminal());
        assert!(!sm.is_awaiting_input());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut sm = PhaseStateMachine::new();
        for phase in [
            Phase::SchemaLoading,
            Phase::QueryUnderstanding,
            Phase::JoinInference,
            Phase::GeneratingSql,
            Phase::ExecutingQuery,
            Phase::Completed,
        ] {
            transition(&mut sm, phase).unwrap();
        }
        assert_eq!(sm.current(), Phase::Completed);
        assert_eq!(sm.transitions().len(), 6);
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_invalid_transition_leaves_state_untouched() {
        let mut sm = PhaseStateMachine::new();
        let err = transition(&mut sm, Phase::ExecutingQuery).unwrap_err();
        assert_eq!(err.from, Phase::Initializing);
        assert_eq!(err.to, Phase::ExecutingQuery);
        assert_eq!(sm.current(), Phase::Initializing);
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_transition_matrix_matches_successor_table() {
        // For all phase pairs (p, q), transition succeeds iff q is in p's
        // fixed successor set.
        for &from in Phase::all() {
            for &to in Phase::all() {
                let mut sm = PhaseStateMachine::with_phase(from);
                let result = transition(&mut sm, to);
                let expected = from.successors().contains(&to);
                assert_eq!(
                    result.is_ok(),
                    expected,
                    "transition {} -> {} should be {}",
                    from,
                    to,
                    if expected { "legal" } else { "illegal" }
                );
                if expected {
                    assert_eq!(sm.current(), to);
                    assert_eq!(sm.transitions().len(), 1);
                } else {
                    assert_eq!(sm.current(), from);
                    assert!(sm.transitions().is_empty());
                }
            }
        }
    }

    #[test]
    fn test_terminal_phases_have_no_successors() {
        assert!(Phase::Completed.successors().is_empty());
        assert!(Phase::Failed.successors().is_empty());
    }

    #[test]
    fn test_awaiting_correction_can_restart() {
        let mut sm = PhaseStateMachine::with_phase(Phase::AwaitingCorrection);
        assert!(sm.is_awaiting_input());
        transition(&mut sm, Phase::QueryUnderstanding).unwrap();
        assert_eq!(sm.current(), Phase::QueryUnderstanding);
    }

    #[test]
    fn test_interrupted_can_resume_pipeline_phases() {
        for resume_to in [
            Phase::SchemaLoading,
            Phase::QueryUnderstanding,
            Phase::GeneratingSql,
            Phase::ExecutingQuery,
        ] {
            let mut sm = PhaseStateMachine::with_phase(Phase::Interrupted);
            transition(&mut sm, resume_to).unwrap();
        }
        // But not straight to a terminal success
        let mut sm = PhaseStateMachine::with_phase(Phase::Interrupted);
        assert!(transition(&mut sm, Phase::Completed).is_err());
    }

    #[test]
    fn test_serde_round_trip_preserves_log_order() {
        let mut sm = PhaseStateMachine::new();
        transition(&mut sm, Phase::SchemaLoading).unwrap();
        transition(&mut sm, Phase::QueryUnderstanding).unwrap();
        transition(&mut sm, Phase::GeneratingSql).unwrap();

        let json = serde_json::to_string(&sm).unwrap();
        let parsed: PhaseStateMachine = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.current(), Phase::GeneratingSql);
        assert_eq!(parsed.transitions().len(), 3);
        assert_eq!(parsed.transitions()[0].to, Phase::SchemaLoading);
        assert_eq!(parsed.transitions()[2].to, Phase::GeneratingSql);
    }
}
