//! Typed user corrections.
//!
//! A correction is clarifying input supplied while a session is suspended.
//! Each kind derives a canonical constraint string that all subsequent
//! understanding / inference / generation calls must honor. Parsing never
//! fails: input that matches no structured pattern becomes a
//! natural-language correction.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of correction kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CorrectionKind {
    /// Explicit join condition between two tables.
    JoinClarification {
        tables: Vec<String>,
        join_condition: String,
    },
    /// A user term mapped to an actual `table.column`.
    ColumnMapping {
        user_term: String,
        actual_column: String,
    },
    /// The user chose one table, optionally rejecting alternatives.
    TableSelection {
        selected_table: String,
        #[serde(default)]
        rejected_tables: Vec<String>,
    },
    /// Free-text fallback.
    NaturalLanguage { text: String },
}

/// A correction with bookkeeping for the owning session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub kind: CorrectionKind,
    pub timestamp: DateTime<Utc>,
    pub attempt_number: u32,
}

impl Correction {
    pub fn new(kind: CorrectionKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            attempt_number: 0,
        }
    }

    /// Parse raw user input into a typed correction.
    ///
    /// Tries the structured grammars in order (join clarification, column
    /// mapping, table selection) and falls back to natural language, so
    /// this always succeeds.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();

        let kind = try_parse_join(input)
            .or_else(|| try_parse_column_mapping(input))
            .or_else(|| try_parse_table_selection(input))
            .unwrap_or_else(|| CorrectionKind::NaturalLanguage {
                text: input.to_string(),
            });

        tracing::info!(kind = kind.label(), "parsed correction");
        Self::new(kind)
    }

    /// Canonical constraint string injected into downstream LLM calls.
    pub fn to_constraint_string(&self) -> String {
        match &self.kind {
            CorrectionKind::JoinClarification {
                tables,
                join_condition,
            } => format!(
                "MANDATORY JOIN: {} between [{}]",
                join_condition,
                tables.join(", ")
            ),
            CorrectionKind::ColumnMapping {
                user_term,
                actual_column,
            } => format!(
                "COLUMN MAPPING: '{}' maps to '{}'",
                user_term, actual_column
            ),
            CorrectionKind::TableSelection {
                selected_table,
                rejected_tables,
            } => {
                if rejected_tables.is_empty() {
                    format!("MANDATORY TABLE: Use table '{}'", selected_table)
                } else {
                    format!(
                        "MANDATORY TABLE: Use table '{}'. DO NOT use: {}",
                        selected_table,
                        rejected_tables.join(", ")
                    )
                }
            }
            CorrectionKind::NaturalLanguage { text } => {
                format!("USER CLARIFICATION: {}", text)
            }
        }
    }
}

impl CorrectionKind {
    pub fn label(&self) -> &'static str {
        match self {
            CorrectionKind::JoinClarification { .. } => "join_clarification",
            CorrectionKind::ColumnMapping { .. } => "column_mapping",
            CorrectionKind::TableSelection { .. } => "table_selection",
            CorrectionKind::NaturalLanguage { .. } => "natural_language",
        }
    }
}

/// Patterns: "join A.x with B.y", "use A.x = B.y", bare "A.x = B.y".
fn try_parse_join(input: &str) -> Option<CorrectionKind> {
    let patterns = [
        r"(?i)join\s+(\w+)\.(\w+)\s+(?:with|to|and)\s+(\w+)\.(\w+)",
        r"(?i)use\s+(\w+)\.(\w+)\s*=\s*(\w+)\.(\w+)",
        r"(?i)(\w+)\.(\w+)\s*=\s*(\w+)\.(\w+)",
    ];

    for pattern in patterns {
        let re = Regex::new(pattern).ok()?;
        if let Some(caps) = re.captures(input) {
            let (t1, c1, t2, c2) = (&caps[1], &caps[2], &caps[3], &caps[4]);
            return Some(CorrectionKind::JoinClarification {
                tables: vec![t1.to_string(), t2.to_string()],
                join_condition: format!("{}.{} = {}.{}", t1, c1, t2, c2),
            });
        }
    }

    None
}

/// Patterns: "X means T.c", "map X to T.c", "use T.c for X".
fn try_parse_column_mapping(input: &str) -> Option<CorrectionKind> {
    let re = Regex::new(r"(?i)(\w+)\s+means\s+(\w+)\.(\w+)").ok()?;
    if let Some(caps) = re.captures(input) {
        return Some(CorrectionKind::ColumnMapping {
            user_term: caps[1].to_string(),
            actual_column: format!("{}.{}", &caps[2], &caps[3]),
        });
    }

    let re = Regex::new(r"(?i)map\s+(\w+)\s+to\s+(\w+)\.(\w+)").ok()?;
    if let Some(caps) = re.captures(input) {
        return Some(CorrectionKind::ColumnMapping {
            user_term: caps[1].to_string(),
            actual_column: format!("{}.{}", &caps[2], &caps[3]),
        });
    }

    let re = Regex::new(r"(?i)use\s+(\w+)\.(\w+)\s+for\s+(\w+)").ok()?;
    if let Some(caps) = re.captures(input) {
        return Some(CorrectionKind::ColumnMapping {
            user_term: caps[3].to_string(),
            actual_column: format!("{}.{}", &caps[1], &caps[2]),
        });
    }

    None
}

/// Patterns: "use table X", "use X instead of Y", "use table X not Y".
fn try_parse_table_selection(input: &str) -> Option<CorrectionKind> {
    let re = Regex::new(r"(?i)use\s+(?:table\s+)?(\w+)\s+(?:instead\s+of|not|rather\s+than)\s+(\w+)")
        .ok()?;
    if let Some(caps) = re.captures(input) {
        return Some(CorrectionKind::TableSelection {
            selected_table: caps[1].to_string(),
            rejected_tables: vec![caps[2].to_string()],
        });
    }

    let re = Regex::new(r"(?i)^use\s+table\s+(\w+)$").ok()?;
    if let Some(caps) = re.captures(input) {
        return Some(CorrectionKind::TableSelection {
            selected_table: caps[1].to_string(),
            rejected_tables: Vec::new(),
        });
    }

    None
}
