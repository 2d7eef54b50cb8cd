//! Query understanding - identify tables, columns, and requirements.

use crate::outputs::{understanding_schema, UnderstandingOutput};
use crate::prompts;
use crate::similarity::string_similarity;
use nlq_core::{AgentConfig, LlmClient, Message, Schema};
use std::sync::Arc;
use tracing::{info, warn};

/// Analyzed request: which tables and columns are needed and how.
#[derive(Debug, Clone, Default)]
pub struct Understanding {
    pub tables: Vec<String>,
    pub columns: Vec<String>,
    pub joins_needed: bool,
    pub filters: Option<String>,
    pub aggregations: Option<String>,
    pub ordering: Option<String>,
    pub reasoning: Option<String>,
}

/// Understanding either succeeds (possibly empty) or suspends on an
/// ambiguous table reference when the proactive policy is enabled.
#[derive(Debug, Clone)]
pub enum UnderstandingOutcome {
    Ready(Understanding),
    AmbiguousTables { term: String, options: Vec<String> },
}

pub struct QueryUnderstanding {
    schema: Arc<Schema>,
    proactive_ambiguity_check: bool,
    similar_table_threshold: f64,
}

impl QueryUnderstanding {
    pub fn new(schema: Arc<Schema>, config: &AgentConfig) -> Self {
        Self {
            schema,
            proactive_ambiguity_check: config.proactive_ambiguity_check,
            similar_table_threshold: config.similar_table_threshold,
        }
    }

    /// Analyze a request. Never fails: an LLM error produces an empty
    /// understanding and the caller decides whether that is terminal.
    pub async fn analyze(
        &self,
        llm: &dyn LlmClient,
        query: &str,
        constraints: &[String],
    ) -> UnderstandingOutcome {
        info!(query = query, "analyzing query");

        let messages = [
            Message::system(prompts::system_message()),
            Message::user(prompts::query_understanding(query, &self.schema, constraints)),
        ];

        let output = match llm
            .complete_structured(&understanding_schema(), &messages)
            .await
            .and_then(|value| {
                serde_json::from_value::<UnderstandingOutput>(value).map_err(|e| {
                    nlq_core::LlmError::InvalidResponse {
                        message: format!("understanding output mismatch: {}", e),
                    }
                })
            }) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "query understanding failed, returning empty understanding");
                return UnderstandingOutcome::Ready(Understanding {
                    reasoning: Some(format!("Error: {}", e)),
                    ..Understanding::default()
                });
            }
        };

        // Keep only tables that exist in the catalog.
        let mut valid_tables = Vec::new();
        let mut unknown_terms = Vec::new();
        for name in &output.tables {
            if self.schema.get_table(name).is_some() {
                valid_tables.push(name.clone());
            } else {
                warn!(table = name.as_str(), "table not found in schema");
                unknown_terms.push(name.clone());
            }
        }

        if self.proactive_ambiguity_check {
            for term in &unknown_terms {
                let similar = self.similar_tables(term);
                if similar.len() >= 2 {
                    info!(term = term.as_str(), "ambiguous table reference");
                    return UnderstandingOutcome::AmbiguousTables {
                        term: term.clone(),
                        options: similar,
                    };
                }
            }
        }

        info!(tables = ?valid_tables, joins_needed = output.joins_needed, "identified tables");

        UnderstandingOutcome::Ready(Understanding {
            tables: valid_tables,
            columns: output.columns,
            joins_needed: output.joins_needed,
            filters: output.filters,
            aggregations: output.aggregations,
            ordering: output.ordering,
            reasoning: output.reasoning,
        })
    }

    /// Catalog tables whose names closely match `term`.
    fn similar_tables(&self, term: &str) -> Vec<String> {
        let mut matches: Vec<(f64, String)> = self
            .schema
            .table_names()
            .into_iter()
            .filter_map(|name| {
                let score = string_similarity(term, &name);
                (score >= self.similar_table_threshold).then_some((score, name))
            })
            .collect();

        matches.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        matches.into_iter().map(|(_, name)| name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_core::{Column, ColumnType, LlmError, Table};
    use serde_json::json;

    struct StubLlm {
        response: Result<serde_json::Value, &'static str>,
    }

    #[async_trait::async_trait]
    impl LlmClient for StubLlm {
        async fn complete(
            &self,
            _messages: &[Message],
            _temperature: Option<f32>,
        ) -> Result<String, LlmError> {
            unimplemented!("understanding only uses structured calls")
        }

        async fn complete_structured(
            &self,
            _schema: &serde_json::Value,
            _messages: &[Message],
        ) -> Result<serde_json::Value, LlmError> {
            self.response.clone().map_err(|m| LlmError::Api {
                message: m.to_string(),
                status_code: Some(500),
            })
        }
    }

    fn schema() -> Arc<Schema> {
        let mut schema = Schema::new();
        for name in ["orders", "order_items", "customers"] {
            let mut table = Table::new(name);
            table.add_column(Column::new("id", ColumnType::Integer));
            schema.add_table(table);
        }
        Arc::new(schema)
    }

    fn config() -> AgentConfig {
        AgentConfig::default()
    }

    #[tokio::test]
    async fn test_analyze_filters_unknown_tables() {
        let llm = StubLlm {
            response: Ok(json!({
                "tables": ["orders", "shipments"],
                "columns": ["orders.id"],
                "joins_needed": false
            })),
        };
        let understanding = QueryUnderstanding::new(schema(), &config());

        match understanding.analyze(&llm, "count orders", &[]).await {
            UnderstandingOutcome::Ready(u) => {
                assert_eq!(u.tables, vec!["orders"]);
                assert_eq!(u.columns, vec!["orders.id"]);
            }
            other => panic!("expected ready outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_llm_failure_returns_empty() {
        let llm = StubLlm {
            response: Err("server exploded"),
        };
        let understanding = QueryUnderstanding::new(schema(), &config());

        match understanding.analyze(&llm, "count orders", &[]).await {
            UnderstandingOutcome::Ready(u) => {
                assert!(u.tables.is_empty());
                assert!(!u.joins_needed);
                assert!(u.reasoning.unwrap().starts_with("Error:"));
            }
            other => panic!("expected empty understanding, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_proactive_check_surfaces_ambiguity() {
        let llm = StubLlm {
            response: Ok(json!({
                // Close to both "orders" and "order_items"
                "tables": ["order"],
                "columns": [],
                "joins_needed": false
            })),
        };
        let mut cfg = config();
        cfg.proactive_ambiguity_check = true;
        cfg.similar_table_threshold = 0.6;
        let understanding = QueryUnderstanding::new(schema(), &cfg);

        match understanding.analyze(&llm, "count order", &[]).await {
            UnderstandingOutcome::AmbiguousTables { term, options } => {
                assert_eq!(term, "order");
                assert!(options.contains(&"orders".to_string()));
                assert!(options.contains(&"order_items".to_string()));
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_proactive_check_off_by_default() {
        let llm = StubLlm {
            response: Ok(json!({
                "tables": ["order"],
                "columns": [],
                "joins_needed": false
            })),
        };
        let understanding = QueryUnderstanding::new(schema(), &config());

        assert!(matches!(
            understanding.analyze(&llm, "count order", &[]).await,
            UnderstandingOutcome::Ready(_)
        ));
    }
}
