//! Builds the generator chain from configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::GenerationConfig;
use crate::error::{GatewayError, Result};
use crate::llm::{
    Anthropic, ChatClient, ChatConfig, ChatDialect, FallbackGenerator, LlmClient, LlmGenerator,
    LlmProvider, MockLlmClient, OpenAi, PatternGenerator, SqlGenerator,
};

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

/// Creates the chat client behind a model-backed generator.
///
/// The API key comes from `api_key` or the provider's environment variable
/// (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`). The model comes from the config,
/// then `OPENAI_MODEL` / `ANTHROPIC_MODEL`, then a built-in default.
pub fn create_client(
    provider: LlmProvider,
    api_key: Option<String>,
    config: &GenerationConfig,
) -> Result<Arc<dyn LlmClient>> {
    match provider {
        LlmProvider::OpenAi => chat_client::<OpenAi>(api_key, config, "OPENAI_MODEL", DEFAULT_OPENAI_MODEL),
        LlmProvider::Anthropic => {
            chat_client::<Anthropic>(api_key, config, "ANTHROPIC_MODEL", DEFAULT_ANTHROPIC_MODEL)
        }
        LlmProvider::Mock => Ok(Arc::new(MockLlmClient::new())),
        LlmProvider::Pattern => Err(GatewayError::config(
            "The pattern generator does not use an LLM client",
        )),
    }
}

fn chat_client<D: ChatDialect>(
    api_key: Option<String>,
    config: &GenerationConfig,
    model_var: &str,
    default_model: &str,
) -> Result<Arc<dyn LlmClient>> {
    let key = api_key
        .or_else(|| std::env::var(D::KEY_VAR).ok())
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| GatewayError::config(format!("No API key configured. Set {}.", D::KEY_VAR)))?;
    let model = config
        .model
        .clone()
        .or_else(|| std::env::var(model_var).ok())
        .unwrap_or_else(|| default_model.to_string());

    let mut chat = ChatConfig::new(key, model).with_timeout(config.timeout());
    if let Some(endpoint) = &config.endpoint {
        chat = chat.with_endpoint(endpoint.clone());
    }
    Ok(Arc::new(ChatClient::<D>::new(chat)?))
}

fn single_generator(provider: LlmProvider, config: &GenerationConfig) -> Result<Arc<dyn SqlGenerator>> {
    match provider {
        LlmProvider::Pattern => Ok(Arc::new(PatternGenerator::new())),
        other => Ok(Arc::new(LlmGenerator::new(create_client(other, None, config)?))),
    }
}

/// The configured primary generator, wrapped in a `FallbackGenerator` when
/// a different fallback is named.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn SqlGenerator>> {
    let primary_provider: LlmProvider = config.provider.parse()?;
    let primary = single_generator(primary_provider, config)?;

    let fallback_provider = match config.fallback.as_deref() {
        Some(name) => Some(name.parse::<LlmProvider>()?),
        None => None,
    };
    match fallback_provider {
        Some(fallback) if fallback != primary_provider => {
            info!(generator = %primary_provider, %fallback, "SQL generator ready");
            let secondary = single_generator(fallback, config)?;
            Ok(Arc::new(FallbackGenerator::new(primary, secondary)))
        }
        _ => {
            info!(generator = %primary_provider, "SQL generator ready");
            Ok(primary)
        }
    }
}
