//! Join inference between two tables.
//!
//! Heuristic scoring runs first over every type-compatible column pair.
//! The reasoning service is consulted only when constraints are present,
//! no heuristic candidate exists, or the top confidence is below the
//! configured threshold; a non-empty service answer supersedes the
//! heuristic list entirely. Ambiguity is a first-class outcome, not an
//! error: the caller must suspend and ask.

use crate::outputs::{join_inference_schema, JoinInferenceOutput};
use crate::prompts;
use crate::similarity::string_similarity;
use nlq_core::{Column, JoinCandidate, LlmClient, LlmError, Message, Schema, Table};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Candidates scoring above this survive the heuristic pass.
const HEURISTIC_FLOOR: f64 = 0.5;
/// Candidates above this confidence participate in ambiguity arbitration.
const AMBIGUITY_FLOOR: f64 = 0.7;
/// Two candidates within this spread of the top are considered rivals.
const AMBIGUITY_SPREAD: f64 = 0.1;

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("table not found in schema: {name}")]
    TableNotFound { name: String },

    #[error("could not infer any join between {left} and {right}")]
    NoJoinFound { left: String, right: String },

    #[error("could not extract SQL from response: {snippet}")]
    SqlExtraction { snippet: String },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Result of arbitration over the final candidate list.
#[derive(Debug, Clone)]
pub enum InferenceOutcome {
    /// Candidates ordered by descending confidence; automatic selection
    /// of the first is safe.
    Resolved(Vec<JoinCandidate>),
    /// Two or more rivals are too close to pick automatically.
    Ambiguous {
        options: Vec<String>,
        candidates: Vec<JoinCandidate>,
    },
}

pub struct JoinInference {
    schema: Arc<Schema>,
    confidence_threshold: f64,
}

impl JoinInference {
    pub fn new(schema: Arc<Schema>, confidence_threshold: f64) -> Self {
        Self {
            schema,
            confidence_threshold,
        }
    }

    /// Infer joins between two tables, ordered by descending confidence.
    pub async fn infer(
        &self,
        llm: &dyn LlmClient,
        left: &str,
        right: &str,
        constraints: &[String],
    ) -> Result<InferenceOutcome, ReasoningError> {
        info!(left = left, right = right, "inferring joins");

        let left_table = self
            .schema
            .get_table(left)
            .ok_or_else(|| ReasoningError::TableNotFound {
                name: left.to_string(),
            })?;
        let right_table =
            self.schema
                .get_table(right)
                .ok_or_else(|| ReasoningError::TableNotFound {
                    name: right.to_string(),
                })?;

        let heuristic = Self::heuristic_candidates(left_table, right_table);

        let needs_llm = !constraints.is_empty()
            || heuristic.is_empty()
            || heuristic[0].confidence < self.confidence_threshold;

        let joins = if needs_llm {
            let llm_joins = self
                .llm_candidates(llm, left, right, constraints)
                .await;
            if llm_joins.is_empty() {
                heuristic
            } else {
                llm_joins
            }
        } else {
            heuristic
        };

        if joins.is_empty() {
            return Err(ReasoningError::NoJoinFound {
                left: left.to_string(),
                right: right.to_string(),
            });
        }

        info!(
            count = joins.len(),
            top_confidence = joins[0].confidence,
            "inference produced candidates"
        );
        Ok(Self::arbitrate(joins))
    }

    /// Score every type-compatible column pair.
    fn heuristic_candidates(left: &Table, right: &Table) -> Vec<JoinCandidate> {
        let mut candidates = Vec::new();

        for left_col in &left.columns {
            for right_col in &right.columns {
                if !left_col.data_type.is_compatible_with(&right_col.data_type) {
                    continue;
                }

                let confidence = Self::join_confidence(left_col, right_col, left, right);
                if confidence > HEURISTIC_FLOOR {
                    let candidate = JoinCandidate::new(
                        &left.name,
                        &right.name,
                        &left_col.name,
                        &right_col.name,
                        confidence,
                    )
                    .with_reasoning(Self::reasoning(left_col, right_col));
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    /// Weighted confidence: name 40%, business alias 25%, primary key 20%,
    /// foreign-key naming pattern 15%. When either side lacks a business
    /// name the alias factor falls back to name similarity.
    fn join_confidence(
        left_col: &Column,
        right_col: &Column,
        left: &Table,
        right: &Table,
    ) -> f64 {
        let name_sim = string_similarity(&left_col.name, &right_col.name);
        let mut score = name_sim * 0.40;

        let alias_sim = match (&left_col.business_name, &right_col.business_name) {
            (Some(a), Some(b)) => string_similarity(a, b),
            _ => name_sim,
        };
        score += alias_sim * 0.25;

        if left_col.is_primary || right_col.is_primary {
            score += 0.20;
        }

        if Self::has_fk_pattern(left_col, right) || Self::has_fk_pattern(right_col, left) {
            score += 0.15;
        }

        debug!(
            left = %left_col.name,
            right = %right_col.name,
            name_sim,
            alias_sim,
            score,
            "scored column pair"
        );
        score.min(1.0)
    }

    /// Column name follows a foreign-key pattern referencing `table`.
    fn has_fk_pattern(column: &Column, table: &Table) -> bool {
        let col = column.name.to_lowercase();
        let table = table.name.to_lowercase();

        [
            format!("{}_id", table),
            format!("{}id", table),
            format!("{}_key", table),
            format!("fk_{}", table),
        ]
        .iter()
        .any(|pattern| col.contains(pattern))
    }

    fn reasoning(left_col: &Column, right_col: &Column) -> String {
        let mut reasons = Vec::new();

        if string_similarity(&left_col.name, &right_col.name) > 0.8 {
            reasons.push("column names are very similar".to_string());
        }
        if let (Some(a), Some(b)) = (&left_col.business_name, &right_col.business_name) {
            if string_similarity(a, b) > 0.8 {
                reasons.push("business names match".to_string());
            }
        }
        if left_col.is_primary || right_col.is_primary {
            reasons.push("involves primary key".to_string());
        }
        if left_col.data_type == right_col.data_type {
            reasons.push(format!("same data type ({:?})", left_col.data_type));
        }

        if reasons.is_empty() {
            "heuristic match based on column analysis".to_string()
        } else {
            format!("join suggested because: {}", reasons.join("; "))
        }
    }

    /// Ask the reasoning service. Failures degrade to an empty list so the
    /// heuristic result still stands.
    async fn llm_candidates(
        &self,
        llm: &dyn LlmClient,
        left: &str,
        right: &str,
        constraints: &[String],
    ) -> Vec<JoinCandidate> {
        info!("consulting reasoning service for join inference");

        let messages = [
            Message::system(prompts::system_message()),
            Message::user(prompts::join_inference(left, right, &self.schema, constraints)),
        ];

        let output = match llm
            .complete_structured(&join_inference_schema(), &messages)
            .await
            .and_then(|value| {
                serde_json::from_value::<JoinInferenceOutput>(value).map_err(|e| {
                    LlmError::InvalidResponse {
                        message: format!("join inference output mismatch: {}", e),
                    }
                })
            }) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "reasoning-service join inference failed");
                return Vec::new();
            }
        };

        if !output.found_joins || output.joins.is_empty() {
            info!("reasoning service found no joins");
            return Vec::new();
        }

        let mut joins: Vec<JoinCandidate> = output
            .joins
            .into_iter()
            .map(|j| {
                let mut candidate = JoinCandidate::new(
                    left,
                    right,
                    j.left_column,
                    j.right_column,
                    j.confidence,
                );
                if let Some(reasoning) = j.reasoning {
                    candidate = candidate.with_reasoning(reasoning);
                }
                candidate
            })
            .collect();

        joins.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        joins
    }

    /// Decide whether automatic selection from an ordered candidate list
    /// is safe.
    fn arbitrate(joins: Vec<JoinCandidate>) -> InferenceOutcome {
        if joins.len() > 1 {
            let top = joins[0].confidence;
            let rivals: Vec<JoinCandidate> = joins
                .iter()
                .filter(|j| {
                    j.confidence > AMBIGUITY_FLOOR && (top - j.confidence).abs() < AMBIGUITY_SPREAD
                })
                .cloned()
                .collect();

            if rivals.len() > 1 {
                warn!(count = rivals.len(), "ambiguous joins detected");
                return InferenceOutcome::Ambiguous {
                    options: rivals.iter().map(|j| j.to_string()).collect(),
                    candidates: rivals,
                };
            }
        }

        InferenceOutcome::Resolved(joins)
    }
}
