//! HTTP plumbing shared by the hosted chat APIs.
//!
//! A provider only describes its request body, how requests are signed and
//! where the text sits in the reply. Sending, error mapping and retries live
//! in [`ChatClient`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::llm::types::Message;
use crate::llm::LlmClient;

const MAX_ATTEMPTS: u32 = 3;
const FIRST_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// SQL answers are short; this bounds runaway explanations.
const DEFAULT_MAX_TOKENS: u32 = 2048;

/// One provider's wire format.
pub trait ChatDialect: Debug + Send + Sync + 'static {
    /// Short name, as used in configuration and logs.
    const NAME: &'static str;
    /// Display name used in error messages.
    const LABEL: &'static str;
    /// Environment variable holding the API key.
    const KEY_VAR: &'static str;
    const ENDPOINT: &'static str;

    type Body: Serialize + Send + Sync;
    type Reply: DeserializeOwned;

    fn body(config: &ChatConfig, messages: &[Message]) -> Self::Body;
    fn sign(config: &ChatConfig, request: RequestBuilder) -> RequestBuilder;
    /// The reply text, or None when the model returned nothing usable.
    fn text(reply: Self::Reply) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    /// Overrides the provider's endpoint, for proxies and compatible servers.
    pub endpoint: Option<String>,
}

impl ChatConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            timeout: DEFAULT_TIMEOUT,
            max_tokens: DEFAULT_MAX_TOKENS,
            endpoint: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// A chat-completion client for the provider `D`.
#[derive(Debug)]
pub struct ChatClient<D> {
    config: ChatConfig,
    http: Client,
    dialect: PhantomData<D>,
}

/// One request attempt: the reply, or the error and whether to try again.
type Attempt = std::result::Result<String, (GatewayError, bool)>;

impl<D: ChatDialect> ChatClient<D> {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::llm(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            dialect: PhantomData,
        })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn endpoint(&self) -> &str {
        self.config.endpoint.as_deref().unwrap_or(D::ENDPOINT)
    }

    async fn send(&self, body: &D::Body) -> Attempt {
        let request = self.http.post(self.endpoint()).json(body);
        let response = D::sign(&self.config, request)
            .send()
            .await
            .map_err(transport_failure::<D>)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| (GatewayError::llm(format!("Failed to read response: {e}")), false))?;
        if !status.is_success() {
            return Err(status_failure::<D>(status, &text));
        }

        let reply: D::Reply = serde_json::from_str(&text).map_err(|e| {
            (GatewayError::llm(format!("Unexpected {} response: {e}", D::LABEL)), false)
        })?;
        D::text(reply).ok_or_else(|| (GatewayError::llm(format!("Empty reply from {}", D::LABEL)), false))
    }
}

#[async_trait]
impl<D: ChatDialect> LlmClient for ChatClient<D> {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let body = D::body(&self.config, messages);
        let body = &body;
        with_retries(D::LABEL, FIRST_RETRY_DELAY, move || self.send(body)).await
    }

    fn name(&self) -> &str {
        D::NAME
    }
}

/// `{"error": {"message": ...}}`, the error envelope both providers use.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

fn status_failure<D: ChatDialect>(status: StatusCode, body: &str) -> (GatewayError, bool) {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => (
            GatewayError::llm(format!("{} rejected the API key; check {}", D::LABEL, D::KEY_VAR)),
            false,
        ),
        StatusCode::TOO_MANY_REQUESTS => (
            GatewayError::llm(format!("{} rate limit reached", D::LABEL)),
            true,
        ),
        _ => {
            let detail = serde_json::from_str::<ErrorEnvelope>(body)
                .map(|envelope| envelope.error.message)
                .unwrap_or_else(|_| format!("HTTP {status}: {body}"));
            (
                GatewayError::llm(format!("{} API error: {detail}", D::LABEL)),
                // Includes 529, Anthropic's "overloaded".
                status.is_server_error(),
            )
        }
    }
}

fn transport_failure<D: ChatDialect>(e: reqwest::Error) -> (GatewayError, bool) {
    if e.is_timeout() {
        (GatewayError::llm(format!("{} request timed out", D::LABEL)), true)
    } else if e.is_connect() {
        (GatewayError::llm(format!("Could not reach the {} API", D::LABEL)), true)
    } else {
        (GatewayError::llm(format!("{} request failed: {e}", D::LABEL)), false)
    }
}

/// Calls `attempt` until it succeeds, fails permanently, or `MAX_ATTEMPTS`
/// is reached. The delay doubles after each retry.
async fn with_retries<F, Fut>(label: &str, first_delay: Duration, mut attempt: F) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut delay = first_delay;
    let mut n = 1;
    loop {
        debug!(provider = label, attempt = n, "Sending chat request");
        match attempt().await {
            Ok(reply) => return Ok(reply),
            Err((error, retryable)) if retryable && n < MAX_ATTEMPTS => {
                warn!(provider = label, attempt = n, ?delay, error = %error, "Chat request failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                n += 1;
            }
            Err((error, _)) => return Err(error),
        }
    }
}
