//! Chat-completion providers behind one async trait: the Anthropic Messages
//! API, anything speaking OpenAI chat completions, and a scripted mock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use td_core::config::AiConfig;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LlmError {
    /// Connection, DNS or TLS failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Decode(String),

    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message of a conversation. The same shape is accepted from the
/// browser and sent to providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-request generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 800,
            temperature: 0.5,
            system_prompt: None,
        }
    }
}

impl From<&AiConfig> for LlmConfig {
    fn from(ai: &AiConfig) -> Self {
        Self {
            model: ai.model.clone(),
            max_tokens: ai.max_tokens,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub stop_reason: Option<String>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, turns: &[ChatTurn], config: &LlmConfig)
        -> Result<Completion, LlmError>;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;
}

/// Build the provider named by `ai.provider`. `None` when the provider is
/// `none`, unknown, or has no API key.
pub fn provider_from_config(ai: &AiConfig, api_key: Option<String>) -> Option<Arc<dyn LlmProvider>> {
    let kind = ai.provider.trim().to_ascii_lowercase();
    if kind.is_empty() || kind == "none" {
        info!("AI chat disabled by config");
        return None;
    }
    let Some(key) = api_key else {
        warn!(provider = %kind, env = %ai.api_key_env, "AI chat disabled: API key not set");
        return None;
    };
    let base_url = ai.base_url.as_deref();
    let provider: Arc<dyn LlmProvider> = match kind.as_str() {
        "anthropic" => Arc::new(AnthropicProvider::new(key).with_base_url_opt(base_url)),
        "openai" => Arc::new(OpenAiProvider::new(key).with_base_url_opt(base_url)),
        other => {
            warn!(provider = other, "unknown AI provider, chat disabled");
            return None;
        }
    };
    info!(provider = provider.name(), model = %ai.model, "AI chat enabled");
    Some(provider)
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

struct Endpoint {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl Endpoint {
    fn new(api_key: String, base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Send, map 429 and non-2xx answers, then decode the JSON body.
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, LlmError> {
        let resp = request.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(LlmError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        resp.json().await.map_err(|e| LlmError::Decode(e.to_string()))
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn wire_messages(turns: &[ChatTurn]) -> impl Iterator<Item = WireMessage<'_>> {
    turns.iter().map(|t| WireMessage {
        role: role_name(t.role),
        content: &t.content,
    })
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

pub struct AnthropicProvider {
    endpoint: Endpoint,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct AnthropicReply {
    content: Vec<AnthropicBlock>,
    model: String,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::new(api_key.into(), "https://api.anthropic.com"),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn with_base_url_opt(self, base_url: Option<&str>) -> Self {
        match base_url {
            Some(url) => self.with_base_url(url),
            None => self,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        config: &LlmConfig,
    ) -> Result<Completion, LlmError> {
        // The system prompt is a top-level field, not a message.
        let body = AnthropicRequest {
            model: &config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system: config.system_prompt.as_deref(),
            messages: wire_messages(turns).collect(),
        };
        let ep = &self.endpoint;
        let request = ep
            .client
            .post(format!("{}/v1/messages", ep.base_url))
            .header("x-api-key", &ep.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        let reply: AnthropicReply = ep.send(request).await?;

        Ok(Completion {
            text: reply.content.into_iter().filter_map(|b| b.text).collect(),
            model: reply.model,
            stop_reason: reply.stop_reason,
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible
// ---------------------------------------------------------------------------

/// OpenAI Chat Completions, or any server speaking the same protocol.
pub struct OpenAiProvider {
    endpoint: Endpoint,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct OpenAiReply {
    choices: Vec<OpenAiChoice>,
    model: String,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::new(api_key.into(), "https://api.openai.com"),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn with_base_url_opt(self, base_url: Option<&str>) -> Self {
        match base_url {
            Some(url) => self.with_base_url(url),
            None => self,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        config: &LlmConfig,
    ) -> Result<Completion, LlmError> {
        let system = config.system_prompt.as_deref().map(|content| WireMessage {
            role: "system",
            content,
        });
        let body = OpenAiRequest {
            model: &config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            messages: system.into_iter().chain(wire_messages(turns)).collect(),
        };
        let ep = &self.endpoint;
        let request = ep
            .client
            .post(format!("{}/v1/chat/completions", ep.base_url))
            .bearer_auth(&ep.api_key)
            .json(&body);
        let reply: OpenAiReply = ep.send(request).await?;

        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Decode("no choices in response".into()))?;
        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            model: reply.model,
            stop_reason: choice.finish_reason,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

type Recorded = (Vec<ChatTurn>, LlmConfig);

/// Answers from a queue, then with a canned reply. Records every request.
#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<Recorded>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(Completion {
            text: text.into(),
            model: "mock".into(),
            stop_reason: Some("end_turn".into()),
        }))
    }

    pub fn with_error(self, error: LlmError) -> Self {
        self.push(Err(error))
    }

    fn push(self, item: Result<Completion, LlmError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
        self
    }

    pub fn captured_requests(&self) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        config: &LlmConfig,
    ) -> Result<Completion, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((turns.to_vec(), config.clone()));
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Completion {
                text: "Mock response".into(),
                model: config.model.clone(),
                stop_reason: None,
            })
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_request_keeps_system_out_of_messages() {
        let turns = [ChatTurn::user("hi")];
        let body = AnthropicRequest {
            model: "m",
            max_tokens: 10,
            temperature: 0.0,
            system: Some("base"),
            messages: wire_messages(&turns).collect(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "base");
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["role"], "user");

        let bare = AnthropicRequest { system: None, ..body };
        assert!(serde_json::to_value(&bare).unwrap().get("system").is_none());
    }

    #[test]
    fn factory_respects_provider_and_key() {
        let mut ai = AiConfig::default();
        assert!(provider_from_config(&ai, None).is_none());
        assert_eq!(provider_from_config(&ai, Some("k".into())).unwrap().name(), "anthropic");
        ai.provider = "OpenAI".into();
        assert_eq!(provider_from_config(&ai, Some("k".into())).unwrap().name(), "openai");
        ai.provider = "none".into();
        assert!(provider_from_config(&ai, Some("k".into())).is_none());
        ai.provider = "palm".into();
        assert!(provider_from_config(&ai, Some("k".into())).is_none());
    }
}
