//! Natural-language to SQL generation.
//!
//! `SqlGenerator` is the seam the pipeline depends on. Implementations:
//! pattern matching (no model), an LLM-backed generator, and a fallback
//! chain that tries a second generator when the first fails.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::parser::parse_llm_response;
use super::prompt::build_messages;
use super::LlmClient;
use crate::db::Schema;
use crate::error::{GatewayError, Result};
use crate::language::Language;
use crate::safety::Classification;

/// Longest model reply echoed back in a generation error.
const MAX_ECHOED_REPLY: usize = 200;

/// A generated statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub explanation: String,
    /// The generator's own classification, if it gave one. The pipeline
    /// only ever uses it to escalate.
    pub reported: Option<Classification>,
    /// Which generator produced the statement.
    pub method: String,
}

impl GeneratedSql {
    pub fn new(
        sql: impl Into<String>,
        explanation: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            sql: sql.into(),
            explanation: explanation.into(),
            reported: None,
            method: method.into(),
        }
    }

    pub fn with_reported(mut self, classification: Classification) -> Self {
        self.reported = Some(classification);
        self
    }
}

/// Turns a question into a single SQL statement.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        schema: &Schema,
        language: Language,
    ) -> Result<GeneratedSql>;

    /// Short name used in logs and the `method` field.
    fn name(&self) -> &str;
}

/// Generator backed by a chat-completion model.
pub struct LlmGenerator {
    client: Arc<dyn LlmClient>,
}

impl LlmGenerator {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SqlGenerator for LlmGenerator {
    async fn generate(
        &self,
        question: &str,
        schema: &Schema,
        language: Language,
    ) -> Result<GeneratedSql> {
        let messages = build_messages(schema, question, language);
        let reply = self
            .client
            .complete(&messages)
            .await
            .map_err(|e| GatewayError::generation(e.to_string()))?;

        let parsed = parse_llm_response(&reply);
        let Some(sql) = parsed.sql else {
            let echoed: String = parsed.text.chars().take(MAX_ECHOED_REPLY).collect();
            return Err(GatewayError::generation(format!(
                "Model did not return SQL: {echoed}"
            )));
        };

        debug!(provider = self.client.name(), "Model returned SQL");
        let generated = GeneratedSql::new(sql, parsed.text, format!("llm:{}", self.client.name()));
        Ok(match parsed.reported {
            Some(reported) => generated.with_reported(reported),
            None => generated,
        })
    }

    fn name(&self) -> &str {
        self.client.name()
    }
}

/// Tries `primary`, then `fallback` if the primary fails.
pub struct FallbackGenerator {
    primary: Arc<dyn SqlGenerator>,
    fallback: Arc<dyn SqlGenerator>,
}

impl FallbackGenerator {
    pub fn new(primary: Arc<dyn SqlGenerator>, fallback: Arc<dyn SqlGenerator>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl SqlGenerator for FallbackGenerator {
    async fn generate(
        &self,
        question: &str,
        schema: &Schema,
        language: Language,
    ) -> Result<GeneratedSql> {
        match self.primary.generate(question, schema, language).await {
            Ok(generated) => Ok(generated),
            Err(primary_err) => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %primary_err,
                    "Primary generator failed, trying fallback"
                );
                self.fallback
                    .generate(question, schema, language)
                    .await
                    .map_err(|fallback_err| {
                        GatewayError::generation(format!(
                            "{}: {}; {}: {}",
                            self.primary.name(),
                            strip_prefix(&primary_err),
                            self.fallback.name(),
                            strip_prefix(&fallback_err)
                        ))
                    })
            }
        }
    }

    fn name(&self) -> &str {
        self.primary.name()
    }
}

/// The inner message of a generation error, without the display prefix.
fn strip_prefix(err: &GatewayError) -> String {
    match err {
        GatewayError::Generation(msg) => msg.clone(),
        other => other.to_string(),
    }
}
