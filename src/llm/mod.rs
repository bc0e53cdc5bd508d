//! SQL generation for querygate.
//!
//! Provides the `SqlGenerator` seam used by the pipeline, the pattern and
//! model-backed generators, and the chat clients behind the latter.

mod anthropic;
mod factory;
mod generator;
mod http;
mod mock;
mod openai;
mod parser;
mod patterns;
mod prompt;
mod types;

pub use anthropic::{Anthropic, AnthropicClient};
pub use factory::{create_client, create_generator};
pub use generator::{FallbackGenerator, GeneratedSql, LlmGenerator, SqlGenerator};
pub use http::{ChatClient, ChatConfig, ChatDialect};
pub use mock::MockLlmClient;
pub use openai::{OpenAi, OpenAiClient};
pub use parser::{parse_llm_response, ParsedResponse};
pub use patterns::PatternGenerator;
pub use prompt::{build_messages, build_system_prompt};
pub use types::{Message, Role};

use async_trait::async_trait;
use std::str::FromStr;

use crate::error::{GatewayError, Result};

/// Trait for chat-completion clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the complete response as a single string.
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

/// Where SQL comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProvider {
    /// Keyword patterns, no model call.
    #[default]
    Pattern,
    OpenAi,
    Anthropic,
    /// Canned responses, for tests and dry runs.
    Mock,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pattern" | "patterns" => Ok(Self::Pattern),
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "mock" => Ok(Self::Mock),
            _ => Err(GatewayError::config(format!("Unknown SQL generator: {}", s))),
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
