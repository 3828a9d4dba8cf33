//! Provider capability interface and chat wire types.
//!
//! The core never speaks a vendor wire protocol itself. Everything it needs
//! from a backend is expressed through the [`Provider`] trait: answer a chat
//! request, report availability, count tokens, and price a token count.
//! Concrete implementations live in the embedding application.

use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,

    /// Image attachments (base64 payloads or URLs).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,

    /// Tool-call payloads emitted by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<serde_json::Value>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    pub fn user_with_images(content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            images,
            ..Self::with_role(MessageRole::User, content)
        }
    }

    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
        }
    }
}

/// A chat request as seen by the routing core.
///
/// Only the fields routing cares about are modeled: the target model, an
/// optional explicit provider override, the message list, declared tool
/// definitions, the thinking flag, and the output-token cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,

    /// Explicit provider override. When set, routing short-circuits to this
    /// provider without evaluating any rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    pub messages: Vec<ChatMessage>,

    /// Declared tool/function definitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,

    /// Request extended-thinking/reasoning mode.
    #[serde(default)]
    pub thinking: bool,

    /// Maximum output tokens. Also used as the output-size estimate when
    /// pricing the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            provider: None,
            messages,
            tools: Vec::new(),
            thinking: false,
            max_tokens: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_thinking(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Whether any message carries image content.
    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| !m.images.is_empty())
    }
}

/// Token counters for a single request or accumulated over a stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    /// Accumulate another usage record, saturating on overflow.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
    }
}

/// A complete (non-streaming) chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub model: String,

    /// The provider that actually answered. With fallback this can differ
    /// from the one originally selected.
    pub provider: String,

    /// Actual token usage as reported by the provider.
    pub usage: TokenUsage,

    /// Actual cost in USD as reported by the provider.
    pub cost: f64,

    pub duration: Duration,
}

/// One chunk of a streaming chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub model: String,
    pub provider: String,

    /// Usage attributable to this chunk. Providers that only report usage at
    /// the end put the full counts on the terminal chunk.
    #[serde(default)]
    pub usage: TokenUsage,

    /// Cost attributable to this chunk, USD.
    #[serde(default)]
    pub cost: f64,

    /// Terminal chunk marker. Usage recording happens when this arrives.
    #[serde(default)]
    pub done: bool,
}

/// Static capability flags for a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub functions: bool,
    pub images: bool,
    pub thinking: bool,
    pub system_messages: bool,
}

/// Per-1K-token USD rates for a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    /// Price a usage record: input and output tokens at their own rates.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (f64::from(usage.prompt_tokens) / 1000.0) * self.input_per_1k
            + (f64::from(usage.completion_tokens) / 1000.0) * self.output_per_1k
    }
}

/// Metadata for one model a provider can serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub max_tokens: u32,
    pub capabilities: Capabilities,
    pub pricing: ModelPricing,
}

/// An interchangeable chat backend.
///
/// Implementations are expected to return promptly once the calling future is
/// dropped or the surrounding request is cancelled; the core never retries
/// inside a single provider (transient-error backoff is the provider's own
/// concern).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key. Unique within a [`ProviderRegistry`].
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Context-window size for a model, in tokens.
    fn token_limit(&self, model: &str) -> u32;

    /// Models this provider can serve.
    fn models(&self) -> Vec<ModelInfo>;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Open a streaming chat. The receiver yields chunks until a `done`
    /// chunk or channel close.
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError>;

    /// Availability probe used by the health checker.
    async fn is_available(&self) -> bool;

    /// Estimated input token count for a message list.
    fn count_tokens(&self, messages: &[ChatMessage]) -> Result<u32, ProviderError>;

    /// Price a token usage for a model using this provider's rate table.
    fn calculate_cost(&self, usage: &TokenUsage, model: &str) -> Result<f64, ProviderError>;
}

/// Registry of providers, keyed by name and preserving registration order.
///
/// Read-only after construction: providers are registered once when the
/// manager is built and never removed at runtime, so lookups need no lock.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Result<Self, ConfigError> {
        if providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut map = HashMap::with_capacity(providers.len());
        let mut order = Vec::with_capacity(providers.len());
        for provider in providers {
            let name = provider.name().to_string();
            if map.insert(name.clone(), provider).is_some() {
                return Err(ConfigError::DuplicateProvider(name));
            }
            order.push(name);
        }

        Ok(Self {
            providers: map,
            order,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Provider names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
