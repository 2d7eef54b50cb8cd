//! Context assembly for reasoning-service calls.
//!
//! These builders collect the schema blocks, join conditions, constraints,
//! and prior errors each call needs. Wording is deliberately minimal.

use nlq_core::{JoinCandidate, Schema};

pub fn system_message() -> String {
    "You are a SQL analyst. Answer precisely using only the provided schema.".to_string()
}

fn constraints_block(constraints: &[String]) -> String {
    if constraints.is_empty() {
        return String::new();
    }
    let mut block = String::from("\nHard constraints (must be honored):\n");
    for constraint in constraints {
        block.push_str(&format!("- {}\n", constraint));
    }
    block
}

pub fn query_understanding(query: &str, schema: &Schema, constraints: &[String]) -> String {
    format!(
        "{}\n\nUser request:\n{}\n{}\n\
         Identify the tables and columns required, whether joins are needed, \
         and any filters, aggregations, or ordering.",
        schema.to_context_string(),
        query,
        constraints_block(constraints),
    )
}

pub fn join_inference(
    left: &str,
    right: &str,
    schema: &Schema,
    constraints: &[String],
) -> String {
    let mut blocks = Vec::new();
    for name in [left, right] {
        if let Some(table) = schema.get_table(name) {
            blocks.push(table.to_schema_string());
        }
    }

    format!(
        "{}\n{}\n\
         Determine how `{}` and `{}` can be joined. Report every plausible \
         column pair with a confidence between 0 and 1.",
        blocks.join("\n\n"),
        constraints_block(constraints),
        left,
        right,
    )
}

pub fn sql_generation(
    query: &str,
    schema: &Schema,
    tables: &[String],
    joins: &[JoinCandidate],
    constraints: &[String],
) -> String {
    let mut prompt = format!(
        "{}\n\nUser request:\n{}\n\nUse only these tables: {}.\n",
        schema.to_context_string(),
        query,
        tables.join(", "),
    );

    if !joins.is_empty() {
        prompt.push_str("Join conditions:\n");
        for join in joins {
            prompt.push_str(&format!("- {}\n", join.to_sql_condition()));
        }
    }

    prompt.push_str(&constraints_block(constraints));
    prompt.push_str("\nReturn a single SQL query in a ```sql code block.");
    prompt
}

#[allow(clippy::too_many_arguments)]
pub fn sql_refinement(
    query: &str,
    schema: &Schema,
    tables: &[String],
    previous_sql: &str,
    error: &str,
    attempt_number: u32,
    joins: &[JoinCandidate],
    constraints: &[String],
) -> String {
    format!(
        "{}\n\nThe previous attempt (#{}) failed.\n\nFailed SQL:\n```sql\n{}\n```\n\n\
         Error:\n{}\n\nFix the query and return the corrected SQL in a ```sql code block.",
        sql_generation(query, schema, tables, joins, constraints),
        attempt_number.saturating_sub(1),
        previous_sql,
        error,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_core::{Column, ColumnType, Table};

    fn schema() -> Schema {
        let mut schema = Schema::new();
        let mut orders = Table::new("orders");
        orders.add_column(Column::new("id", ColumnType::Integer));
        schema.add_table(orders);
        schema
    }

    #[test]
    fn test_constraints_injected() {
        let prompt = query_understanding(
            "count orders",
            &schema(),
            &["MANDATORY TABLE: Use table 'orders'".to_string()],
        );
        assert!(prompt.contains("Hard constraints"));
        assert!(prompt.contains("MANDATORY TABLE"));
    }

    #[test]
    fn test_refinement_includes_error_and_previous_sql() {
        let prompt = sql_refinement(
            "count orders",
            &schema(),
            &["orders".to_string()],
            "SELECT bad",
            "unknown column `bad`",
            2,
            &[],
            &[],
        );
        assert!(prompt.contains("SELECT bad"));
        assert!(prompt.contains("unknown column"));
    }
}
