//! OpenAI chat completions.

use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};

use crate::llm::http::{ChatClient, ChatConfig, ChatDialect};
use crate::llm::types::Message;

pub type OpenAiClient = ChatClient<OpenAi>;

#[derive(Debug)]
pub struct OpenAi;

impl ChatDialect for OpenAi {
    const NAME: &'static str = "openai";
    const LABEL: &'static str = "OpenAI";
    const KEY_VAR: &'static str = "OPENAI_API_KEY";
    const ENDPOINT: &'static str = "https://api.openai.com/v1/chat/completions";

    type Body = CompletionRequest;
    type Reply = CompletionReply;

    fn body(config: &ChatConfig, messages: &[Message]) -> CompletionRequest {
        CompletionRequest {
            model: config.model.clone(),
            messages: messages.to_vec(),
            temperature: 0.0,
            max_tokens: config.max_tokens,
        }
    }

    fn sign(config: &ChatConfig, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&config.api_key)
    }

    fn text(reply: CompletionReply) -> Option<String> {
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct CompletionReply {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    // Null when the model refuses or calls a tool.
    content: Option<String>,
}
