//! Completion providers.
//!
//! A [`CompletionProvider`] turns an agent plus message context into a lazy
//! sequence of text fragments. Two strategies exist:
//!
//! - [`RemoteProvider`]: an OpenAI-compatible chat completions endpoint
//! - [`LocalProvider`]: deterministic role-keyed text, used offline
//!
//! [`selection::build_provider`] picks between them and wraps the remote
//! strategy in a [`FallbackProvider`] so provider errors never reach the
//! run executor.

pub mod chat_completions;
pub mod local;
pub mod provider;
pub mod selection;

pub use chat_completions::RemoteProvider;
pub use local::LocalProvider;
pub use provider::Provider;
pub use selection::{FallbackProvider, Strategy, build_provider, select_strategy};

use crate::orchestrator::domain::{AgentConfig, Message as StoredMessage, MessageRole};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Remote connection and sampling settings. Read once at startup.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the API (e.g., `https://api.openai.com`). Empty disables
    /// the remote strategy.
    pub base_url: String,
    /// Credential for the remote endpoint.
    pub api_key: Option<String>,
    /// Model used when an agent does not name one.
    pub default_model: String,
    pub temperature: f64,
    /// Omitted from requests when `None`.
    pub max_tokens: Option<u32>,
    /// Budget for one run's provider call, fragments included. Enforced by
    /// the run executor; the HTTP client only gets a looser backstop.
    pub request_timeout: Duration,
    /// Detected from `base_url`.
    pub provider: Provider,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("default_model", &self.default_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout", &self.request_timeout)
            .field("provider", &self.provider)
            .finish()
    }
}

impl LlmSettings {
    pub fn remote_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Settings with no remote endpoint; the local strategy is always chosen.
    pub fn offline(default_model: impl Into<String>) -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            default_model: default_model.into(),
            temperature: 0.7,
            max_tokens: None,
            request_timeout: Duration::from_secs(120),
            provider: Provider::Compatible,
        }
    }
}

/// Wire role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for ChatRole {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => Self::System,
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

impl From<&StoredMessage> for ChatMessage {
    fn from(msg: &StoredMessage) -> Self {
        Self {
            role: msg.role.into(),
            content: msg.content.clone(),
        }
    }
}

/// One provider call: the agent, its context, and the delivery flag.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub agent: AgentConfig,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

impl CompletionRequest {
    /// System prompt (when set) followed by the conversation history.
    pub fn for_agent(agent: &AgentConfig, history: &[StoredMessage], stream: bool) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !agent.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(agent.system_prompt.clone()));
        }
        messages.extend(history.iter().map(ChatMessage::from));
        Self {
            agent: agent.clone(),
            messages,
            stream,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("remote provider requires an API key (set OPENAI_API_KEY or LLM_API_KEY)")]
    MissingCredential,
    #[error("request failed: {0}")]
    Transport(reqwest::Error),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("upstream returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// The call ran out of time. Not recoverable by falling back: the run
    /// budget is already spent.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err)
        }
    }
}

/// One unit of provider output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Appended to the reply.
    Text(String),
    /// Starts the reply over with this text. Whatever came before was
    /// already delivered but is not part of the final content.
    Restart(String),
}

impl Fragment {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(s) | Self::Restart(s) => s,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Text(s) | Self::Restart(s) => s,
        }
    }
}

impl From<String> for Fragment {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, ProviderError>> + Send>>;

/// Produces text fragments for one request. A single fragment when
/// `request.stream` is false.
#[async_trait]
pub trait CompletionProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn complete(&self, request: CompletionRequest) -> Result<FragmentStream, ProviderError>;
}
