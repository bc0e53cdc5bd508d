//! Anthropic messages API.

use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};

use crate::llm::http::{ChatClient, ChatConfig, ChatDialect};
use crate::llm::types::{Message, Role};

const API_VERSION: &str = "2023-06-01";

pub type AnthropicClient = ChatClient<Anthropic>;

#[derive(Debug)]
pub struct Anthropic;

impl ChatDialect for Anthropic {
    const NAME: &'static str = "anthropic";
    const LABEL: &'static str = "Anthropic";
    const KEY_VAR: &'static str = "ANTHROPIC_API_KEY";
    const ENDPOINT: &'static str = "https://api.anthropic.com/v1/messages";

    type Body = MessagesRequest;
    type Reply = MessagesReply;

    /// The system prompt is a top-level field here, not a message.
    fn body(config: &ChatConfig, messages: &[Message]) -> MessagesRequest {
        let (system, turns): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);
        let system = system
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        MessagesRequest {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system: (!system.is_empty()).then_some(system),
            messages: turns.into_iter().cloned().collect(),
        }
    }

    fn sign(config: &ChatConfig, request: RequestBuilder) -> RequestBuilder {
        request
            .header("x-api-key", &config.api_key)
            .header("anthropic-version", API_VERSION)
    }

    fn text(reply: MessagesReply) -> Option<String> {
        let text: String = reply
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesReply {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}
