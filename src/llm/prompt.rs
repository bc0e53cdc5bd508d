//! Prompt construction for SQL generation requests.

use crate::db::Schema;
use crate::language::Language;
use crate::llm::types::Message;

/// System prompt template for the SQL generator.
const SYSTEM_PROMPT_TEMPLATE: &str = r#"You are an expert PostgreSQL assistant. Convert natural-language questions into a single valid PostgreSQL statement.

DATABASE SCHEMA:
{schema}

RULES:
- Generate exactly one statement, PostgreSQL dialect
- Use LIMIT for row limiting; limit reads to 100 rows unless asked otherwise
- UPDATE and DELETE must have a WHERE clause unless the user explicitly asks to affect all rows
- Use JOINs that follow the foreign keys above
- Never generate DROP DATABASE or similar destructive operations unless explicitly requested

RESPONSE FORMAT:
Return ONLY a JSON object with these fields:
{
  "sql": "the statement",
  "query_type": "READ|WRITE_SAFE|WRITE_RISKY|ADMIN",
  "risk_level": "low|medium|high|critical",
  "explanation": "what the statement does, in {language}"
}

QUERY TYPES:
- READ: SELECT, SHOW, DESCRIBE, EXPLAIN
- WRITE_SAFE: INSERT, UPDATE/DELETE with a specific WHERE clause
- WRITE_RISKY: UPDATE/DELETE without WHERE or touching many rows, TRUNCATE, MERGE
- ADMIN: CREATE, DROP, ALTER, GRANT, REVOKE"#;

fn language_name(language: Language) -> &'static str {
    match language {
        Language::En => "English",
        Language::He => "Hebrew",
    }
}

/// Builds the system prompt with the database schema injected.
pub fn build_system_prompt(schema: &Schema, language: Language) -> String {
    let schema_text = if schema.is_empty() {
        "(schema unavailable)".to_string()
    } else {
        schema.describe()
    };
    SYSTEM_PROMPT_TEMPLATE
        .replace("{schema}", &schema_text)
        .replace("{language}", language_name(language))
}

/// Builds the message list for a single question.
pub fn build_messages(schema: &Schema, question: &str, language: Language) -> Vec<Message> {
    vec![
        Message::system(build_system_prompt(schema, language)),
        Message::user(question.trim()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Column, Table};
    use crate::llm::types::Role;

    fn sample_schema() -> Schema {
        let mut schema = Schema::new();
        schema.tables.push(
            Table::new("companies")
                .with_column(Column::new("id", "integer").primary())
                .with_column(Column::new("name", "text")),
        );
        schema
    }

    #[test]
    fn test_system_prompt_includes_schema() {
        let prompt = build_system_prompt(&sample_schema(), Language::En);
        assert!(prompt.contains("companies"));
        assert!(prompt.contains("\"query_type\""));
        assert!(prompt.contains("in English"));
        assert!(!prompt.contains("{schema}"));
    }

    #[test]
    fn test_system_prompt_for_hebrew() {
        let prompt = build_system_prompt(&Schema::new(), Language::He);
        assert!(prompt.contains("(schema unavailable)"));
        assert!(prompt.contains("in Hebrew"));
    }

    #[test]
    fn test_build_messages() {
        let messages = build_messages(&sample_schema(), "  How many companies?  ", Language::En);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "How many companies?");
    }
}
