//! Relation catalog - tables, columns, and join candidates.
//!
//! The catalog is read-only at runtime. It is loaded once, shared via
//! `Arc`, and snapshotted into every session so that persisted sessions
//! remain interpretable even after the live catalog changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Column data types, grouped into join-compatible families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Timestamp,
    Numeric,
    Unknown,
}

impl ColumnType {
    /// Whether two types may appear on either side of an equi-join.
    /// Identical types are always compatible; otherwise both must belong
    /// to the same family (integer-like, string-like, or date/time-like).
    pub fn is_compatible_with(&self, other: &ColumnType) -> bool {
        if self == other {
            return true;
        }

        const GROUPS: [&[ColumnType]; 3] = [
            &[ColumnType::Integer, ColumnType::Numeric, ColumnType::Float],
            &[ColumnType::String],
            &[ColumnType::Date, ColumnType::DateTime, ColumnType::Timestamp],
        ];

        GROUPS
            .iter()
            .any(|group| group.contains(self) && group.contains(other))
    }
}

/// A single column with its business metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Business-facing alias, e.g. "Customer ID" for `cust_id`.
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub data_type: ColumnType,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_pii: bool,
    /// Back-reference to the owning table, set by `Table::add_column`.
    #[serde(default)]
    pub table_name: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            business_name: None,
            description: None,
            data_type,
            is_primary: false,
            is_pii: false,
            table_name: None,
        }
    }

    /// Fully qualified name (`table.column`) when the table is known.
    pub fn full_name(&self) -> String {
        match &self.table_name {
            Some(table) => format!("{}.{}", table, self.name),
            None => self.name.clone(),
        }
    }
}

/// A table with its columns and business context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub business_context: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            business_context: None,
            columns: Vec::new(),
        }
    }

    pub fn add_column(&mut self, mut column: Column) {
        column.table_name = Some(self.name.clone());
        self.columns.push(column);
    }

    /// Case-insensitive column lookup.
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_keys(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.is_primary).collect()
    }

    /// Human-readable schema block used as LLM context.
    pub fn to_schema_string(&self) -> String {
        let mut lines = vec![format!("Table: {}", self.name)];
        if let Some(desc) = &self.description {
            lines.push(format!("Description: {}", desc));
        }
        if let Some(ctx) = &self.business_context {
            lines.push(format!("Business Context: {}", ctx));
        }

        lines.push("Columns:".to_string());
        for col in &self.columns {
            let mut info = format!("  - {} ({:?})", col.name, col.data_type);
            if let Some(business) = &col.business_name {
                info.push_str(&format!(" [Business Name: {}]", business));
            }
            if let Some(desc) = &col.description {
                info.push_str(&format!(" - {}", desc));
            }
            if col.is_primary {
                info.push_str(" [PRIMARY KEY]");
            }
            if col.is_pii {
                info.push_str(" [PII]");
            }
            lines.push(info);
        }

        lines.join("\n")
    }
}

/// The complete relation catalog.
///
/// Tables are kept in a `BTreeMap` so snapshots and context strings are
/// deterministically ordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub tables: BTreeMap<String, Table>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Case-insensitive table lookup.
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables
            .values()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Load a catalog from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Complete catalog description for LLM context.
    pub fn to_context_string(&self) -> String {
        let mut lines = vec![
            "=== DATABASE SCHEMA ===".to_string(),
            format!("Project: {}", self.project_id.as_deref().unwrap_or("N/A")),
            format!("Dataset: {}", self.dataset.as_deref().unwrap_or("N/A")),
            format!("Total Tables: {}", self.tables.len()),
            String::new(),
        ];

        for table in self.tables.values() {
            lines.push(table.to_schema_string());
            lines.push(String::new());
        }

        lines.join("\n")
    }
}

/// A scored hypothesis that two columns form a valid join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCandidate {
    pub left_table: String,
    pub right_table: String,
    pub left_column: String,
    pub right_column: String,
    /// Always within [0.0, 1.0]; clamped on construction.
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl JoinCandidate {
    pub fn new(
        left_table: impl Into<String>,
        right_table: impl Into<String>,
        left_column: impl Into<String>,
        right_column: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            left_table: left_table.into(),
            right_table: right_table.into(),
            left_column: left_column.into(),
            right_column: right_column.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// SQL join condition (`left.col = right.col`).
    pub fn to_sql_condition(&self) -> String {
        format!(
            "{}.{} = {}.{}",
            self.left_table, self.left_column, self.right_table, self.right_column
        )
    }
}

impl std::fmt::Display for JoinCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (confidence: {:.2})",
            self.to_sql_condition(),
            self.confidence
        )
    }
}
