//! Structured-output contracts for reasoning-service calls.
//!
//! Each type pairs a serde model with the JSON schema handed to
//! `complete_structured`, so responses are enforced at the service side
//! and parsed without ad hoc text scraping.

use serde::Deserialize;
use serde_json::{json, Value};

/// Output of the query-understanding call.
#[derive(Debug, Clone, Deserialize)]
pub struct UnderstandingOutput {
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub joins_needed: bool,
    #[serde(default)]
    pub filters: Option<String>,
    #[serde(default)]
    pub aggregations: Option<String>,
    #[serde(default)]
    pub ordering: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

pub fn understanding_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tables": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Table names required for the query"
            },
            "columns": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Column names in table.column format"
            },
            "joins_needed": {"type": "boolean"},
            "filters": {"type": ["string", "null"]},
            "aggregations": {"type": ["string", "null"]},
            "ordering": {"type": ["string", "null"]},
            "reasoning": {"type": ["string", "null"]}
        },
        "required": ["tables", "columns", "joins_needed"],
        "additionalProperties": false
    })
}

/// One join hypothesis from the reasoning service.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinOutput {
    pub left_column: String,
    pub right_column: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Output of the join-inference call.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinInferenceOutput {
    pub found_joins: bool,
    #[serde(default)]
    pub joins: Vec<JoinOutput>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

pub fn join_inference_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "found_joins": {"type": "boolean"},
            "joins": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "left_column": {"type": "string"},
                        "right_column": {"type": "string"},
                        "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                        "reasoning": {"type": ["string", "null"]}
                    },
                    "required": ["left_column", "right_column", "confidence"],
                    "additionalProperties": false
                }
            },
            "reasoning": {"type": ["string", "null"]}
        },
        "required": ["found_joins", "joins"],
        "additionalProperties": false
    })
}
