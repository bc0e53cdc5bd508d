//! Scripted chat client for tests and dry runs.
//!
//! Scripted replies are matched by substring of the question. Unscripted
//! questions of the form "count <table>" or "list <table>" get a fenced SQL
//! answer; anything else gets a reply with no SQL in it.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::llm::types::{Message, Role};
use crate::llm::LlmClient;

const FILLER: &[&str] = &["all", "the", "of", "my", "every"];

#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    scripted: Vec<(String, String)>,
    failure: Option<String>,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Questions containing `needle` (case-insensitive) get `reply` verbatim.
    pub fn with_response(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.scripted.push((needle.into().to_lowercase(), reply.into()));
        self
    }

    /// Every call fails with an LLM error carrying `message`.
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Sleeps before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn reply_to(&self, question: &str) -> String {
        let lower = question.to_lowercase();
        if let Some((_, reply)) = self.scripted.iter().find(|(needle, _)| lower.contains(needle.as_str())) {
            return reply.clone();
        }

        let mut words = lower
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty() && !FILLER.contains(w));
        let sql = match (words.next(), words.next()) {
            (Some("count"), Some(table)) => Some(format!("SELECT COUNT(*) AS count FROM {table};")),
            (Some("list" | "show"), Some(table)) => Some(format!("SELECT * FROM {table} LIMIT 100;")),
            _ => None,
        };
        match sql {
            Some(sql) => format!("```sql\n{sql}\n```"),
            None => "I can't answer that with a query. Could you rephrase it?".to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(GatewayError::llm(message.clone()));
        }
        let question = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(self.reply_to(question))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
