//! Scripted database for tests.
//!
//! Responses are chosen by case-insensitive substring match on the SQL. Every
//! statement is recorded along with whether it ran in a transaction.

use super::{ColumnInfo, DatabaseClient, QueryResult, Schema, Value};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum MockResponse {
    Result(QueryResult),
    Failure(String),
}

/// A statement that reached the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub transactional: bool,
}

#[derive(Debug, Default)]
pub struct MockDatabaseClient {
    schema: Schema,
    responses: Vec<(String, MockResponse)>,
    executed: Mutex<Vec<ExecutedStatement>>,
}

impl MockDatabaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The schema `introspect_schema` returns.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Returns `result` for any statement containing `pattern`.
    pub fn with_result(mut self, pattern: impl Into<String>, result: QueryResult) -> Self {
        self.responses
            .push((pattern.into().to_lowercase(), MockResponse::Result(result)));
        self
    }

    /// Fails any statement containing `pattern` with `message`.
    pub fn with_failure(mut self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses.push((
            pattern.into().to_lowercase(),
            MockResponse::Failure(message.into()),
        ));
        self
    }

    /// Statements received so far, in order.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.executed
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of statements that ran matching `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        let pattern = pattern.to_lowercase();
        self.executed()
            .iter()
            .filter(|s| s.sql.to_lowercase().contains(&pattern))
            .count()
    }

    fn respond(&self, sql: &str, transactional: bool) -> Result<QueryResult> {
        if let Ok(mut log) = self.executed.lock() {
            log.push(ExecutedStatement {
                sql: sql.to_string(),
                transactional,
            });
        }

        let lowered = sql.to_lowercase();
        let scripted = self
            .responses
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());

        match scripted {
            Some(MockResponse::Result(result)) => Ok(result),
            Some(MockResponse::Failure(message)) => Err(GatewayError::execution(message)),
            None => Ok(default_result(sql)),
        }
    }
}

fn default_result(sql: &str) -> QueryResult {
    if sql.trim_start().to_uppercase().starts_with("SELECT") {
        QueryResult::with_data(
            vec![ColumnInfo::new("result", "text")],
            vec![vec![Value::Text(format!("Mock result for: {}", sql))]],
        )
    } else {
        QueryResult::affected(0)
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn introspect_schema(&self) -> Result<Schema> {
        Ok(self.schema.clone())
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        self.respond(sql, false)
    }

    async fn execute_in_transaction(&self, sql: &str) -> Result<QueryResult> {
        self.respond(sql, true)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
