//! SQL generation and error-driven refinement.

use crate::inference::ReasoningError;
use crate::prompts;
use nlq_core::{JoinCandidate, LlmClient, Message, Schema};
use regex::Regex;
use std::sync::Arc;
use tracing::info;

pub struct SqlGenerator {
    schema: Arc<Schema>,
}

impl SqlGenerator {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    /// Generate a statement from scratch.
    pub async fn generate(
        &self,
        llm: &dyn LlmClient,
        query: &str,
        tables: &[String],
        joins: &[JoinCandidate],
        constraints: &[String],
    ) -> Result<String, ReasoningError> {
        info!(query = query, tables = ?tables, "generating SQL");

        let messages = [
            Message::system(prompts::system_message()),
            Message::user(prompts::sql_generation(
                query,
                &self.schema,
                tables,
                joins,
                constraints,
            )),
        ];

        // Deterministic generation for SQL.
        let response = llm.complete(&messages, Some(0.0)).await?;
        let sql = clean_sql(&extract_sql(&response)?);
        info!(sql_prefix = sql.get(..200).unwrap_or(&sql), "generated SQL");
        Ok(sql)
    }

    /// Refine a failed statement using the error as feedback.
    #[allow(clippy::too_many_arguments)]
    pub async fn refine(
        &self,
        llm: &dyn LlmClient,
        query: &str,
        tables: &[String],
        previous_sql: &str,
        error: &str,
        attempt_number: u32,
        joins: &[JoinCandidate],
        constraints: &[String],
    ) -> Result<String, ReasoningError> {
        info!(
            attempt = attempt_number,
            error_prefix = error.get(..100).unwrap_or(error),
            "refining SQL"
        );

        let messages = [
            Message::system(prompts::system_message()),
            Message::user(prompts::sql_refinement(
                query,
                &self.schema,
                tables,
                previous_sql,
                error,
                attempt_number,
                joins,
                constraints,
            )),
        ];

        let response = llm.complete(&messages, Some(0.0)).await?;
        let sql = clean_sql(&extract_sql(&response)?);
        info!(
            attempt = attempt_number,
            sql_prefix = sql.get(..200).unwrap_or(&sql),
            "refined SQL"
        );
        Ok(sql)
    }
}

/// Pull the SQL out of a model response: fenced code block first, then the
/// first SELECT statement, then keyword-line scanning.
fn extract_sql(response: &str) -> Result<String, ReasoningError> {
    let code_block = Regex::new(r"(?is)```(?:sql)?\s*\n(.*?)\n```").expect("static regex");
    if let Some(caps) = code_block.captures(response) {
        return Ok(caps[1].trim().to_string());
    }

    let select = Regex::new(r"(?is)(SELECT\s+.+?)(;|\n\n|$)").expect("static regex");
    if let Some(caps) = select.captures(response) {
        return Ok(caps[1].trim().to_string());
    }

    // Last resort: collect lines from the first SQL keyword to a semicolon.
    let keywords = ["SELECT", "FROM", "WHERE", "JOIN", "GROUP BY", "ORDER BY"];
    let mut sql_lines = Vec::new();
    let mut in_sql = false;

    for line in response.lines() {
        let upper = line.to_uppercase();
        if keywords.iter().any(|k| upper.contains(k)) {
            in_sql = true;
        }
        if in_sql {
            sql_lines.push(line);
            if line.contains(';') {
                break;
            }
        }
    }

    if !sql_lines.is_empty() {
        return Ok(sql_lines.join("\n").trim().to_string());
    }

    Err(ReasoningError::SqlExtraction {
        snippet: response.chars().take(200).collect(),
    })
}

/// Normalize formatting: drop fences and trailing semicolons, collapse
/// whitespace, break before major keywords.
fn clean_sql(sql: &str) -> String {
    let sql = sql.replace("```sql", "").replace("```", "");
    let sql = sql.trim().trim_end_matches(';').trim();

    let collapsed = Regex::new(r"\s+")
        .expect("static regex")
        .replace_all(sql, " ")
        .to_string();

    Regex::new(r"(?i)\s+(LEFT JOIN|RIGHT JOIN|INNER JOIN|GROUP BY|ORDER BY|FROM|WHERE|JOIN|HAVING|LIMIT)")
        .expect("static regex")
        .replace_all(&collapsed, "\n${1}")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_core::LlmError;

    struct StubLlm {
        response: String,
    }

    #[async_trait::async_trait]
    impl LlmClient for StubLlm {
        async fn complete(
            &self,
            _messages: &[Message],
            temperature: Option<f32>,
        ) -> Result<String, LlmError> {
            assert_eq!(temperature, Some(0.0));
            Ok(self.response.clone())
        }

        async fn complete_structured(
            &self,
            _schema: &serde_json::Value,
            _messages: &[Message],
        ) -> Result<serde_json::Value, LlmError> {
            unimplemented!("generator only uses free-text completion")
        }
    }

    #[test]
    fn test_extract_from_code_block() {
        let response = "Here you go:\n```sql\nSELECT 1\nFROM t\n```\nDone.";
        assert_eq!(extract_sql(response).unwrap(), "SELECT 1\nFROM t");
    }

    #[test]
    fn test_extract_bare_select() {
        let response = "SELECT id FROM orders WHERE total > 10;";
        assert_eq!(
            extract_sql(response).unwrap(),
            "SELECT id FROM orders WHERE total > 10"
        );
    }

    #[test]
    fn test_extract_keyword_lines() {
        let response = "here is the query\nFROM orders taken alone"; // no SELECT
        assert!(extract_sql(response).unwrap().contains("FROM orders"));
    }

    #[test]
    fn test_extract_failure() {
        let err = extract_sql("I cannot answer that.").unwrap_err();
        assert!(matches!(err, ReasoningError::SqlExtraction { .. }));
    }

    #[test]
    fn test_clean_sql_formatting() {
        let cleaned = clean_sql("SELECT a,   b\n\tFROM t   WHERE x = 1;");
        assert_eq!(cleaned, "SELECT a, b\nFROM t\nWHERE x = 1");
    }

    #[test]
    fn test_clean_sql_strips_fences() {
        let cleaned = clean_sql("```sql\nSELECT 1\n```");
        assert_eq!(cleaned, "SELECT 1");
    }

    #[tokio::test]
    async fn test_generate_round_trip() {
        let generator = SqlGenerator::new(Arc::new(Schema::new()));
        let llm = StubLlm {
            response: "```sql\nSELECT COUNT(*) FROM orders\n```".to_string(),
        };

        let sql = generator
            .generate(&llm, "how many orders", &["orders".to_string()], &[], &[])
            .await
            .unwrap();

        assert_eq!(sql, "SELECT COUNT(*)\nFROM orders");
    }

    #[tokio::test]
    async fn test_refine_round_trip() {
        let generator = SqlGenerator::new(Arc::new(Schema::new()));
        let llm = StubLlm {
            response: "SELECT COUNT(*) FROM orders_v2".to_string(),
        };

        let sql = generator
            .refine(
                &llm,
                "how many orders",
                &["orders_v2".to_string()],
                "SELECT COUNT(*) FROM orders",
                "table orders not found",
                2,
                &[],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(sql, "SELECT COUNT(*)\nFROM orders_v2");
    }
}
