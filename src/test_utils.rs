//! Test utilities: a scriptable in-memory provider and request factories.
//!
//! Used by this crate's own test suites and available to embedding
//! applications that want to exercise routing, failover, and budget
//! behavior without touching a real backend.

use crate::error::ProviderError;
use crate::pricing;
use crate::provider::{
    Capabilities, ChatMessage, ChatRequest, ChatResponse, ModelInfo, ModelPricing, Provider,
    StreamChunk, TokenUsage,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// In-memory provider with scriptable failure modes and call counters.
///
/// Construction-time knobs use builder methods; runtime toggles
/// (`set_available`, `set_fail_chat`, …) take `&self` so tests can flip
/// behavior on an `Arc` already handed to a manager.
pub struct MockProvider {
    name: String,
    capabilities: Capabilities,
    token_limit: u32,
    pricing: ModelPricing,
    usage: TokenUsage,
    cost: f64,
    probe_delay: Option<Duration>,
    chat_delay: Option<Duration>,

    available: AtomicBool,
    fail_chat: AtomicBool,
    fail_stream: AtomicBool,
    fail_count_tokens: AtomicBool,
    fail_calculate_cost: AtomicBool,
    omit_done_chunk: AtomicBool,

    chat_calls: AtomicU32,
    stream_calls: AtomicU32,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        let pricing = pricing::lookup("mock-model");
        let usage = TokenUsage::new(120, 60);
        Self {
            name: name.into(),
            capabilities: Capabilities {
                functions: true,
                images: true,
                thinking: true,
                system_messages: true,
            },
            token_limit: 128_000,
            pricing,
            usage,
            cost: pricing.cost(&usage),
            probe_delay: None,
            chat_delay: None,
            available: AtomicBool::new(true),
            fail_chat: AtomicBool::new(false),
            fail_stream: AtomicBool::new(false),
            fail_count_tokens: AtomicBool::new(false),
            fail_calculate_cost: AtomicBool::new(false),
            omit_done_chunk: AtomicBool::new(false),
            chat_calls: AtomicU32::new(0),
            stream_calls: AtomicU32::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_token_limit(mut self, token_limit: u32) -> Self {
        self.token_limit = token_limit;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// What `chat` and the terminal stream chunk report as actual usage.
    pub fn with_usage(mut self, usage: TokenUsage, cost: f64) -> Self {
        self.usage = usage;
        self.cost = cost;
        self
    }

    /// Delay applied to availability probes.
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    /// Delay applied to chat calls, for cancellation tests.
    pub fn with_chat_delay(mut self, delay: Duration) -> Self {
        self.chat_delay = Some(delay);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_fail_chat(&self, fail: bool) {
        self.fail_chat.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stream(&self, fail: bool) {
        self.fail_stream.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_count_tokens(&self, fail: bool) {
        self.fail_count_tokens.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_calculate_cost(&self, fail: bool) {
        self.fail_calculate_cost.store(fail, Ordering::SeqCst);
    }

    /// Close the stream after the content chunks without a `done` marker,
    /// simulating an interrupted stream.
    pub fn set_omit_done_chunk(&self, omit: bool) {
        self.omit_done_chunk.store(omit, Ordering::SeqCst);
    }

    pub fn chat_calls(&self) -> u32 {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn token_limit(&self, _model: &str) -> u32 {
        self.token_limit
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "mock-model".into(),
            name: format!("{} mock model", self.name),
            max_tokens: self.token_limit,
            capabilities: self.capabilities,
            pricing: self.pricing,
        }]
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();

        if let Some(delay) = self.chat_delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: 500,
                message: "mock provider failure".into(),
            });
        }

        Ok(ChatResponse {
            message: ChatMessage::assistant("mock response"),
            model: request.model,
            provider: self.name.clone(),
            usage: self.usage,
            cost: self.cost,
            duration: start.elapsed(),
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: 502,
                message: "mock streaming failure".into(),
            });
        }

        let (tx, rx) = mpsc::channel(8);
        let provider = self.name.clone();
        let model = request.model;
        let usage = self.usage;
        let cost = self.cost;
        let omit_done = self.omit_done_chunk.load(Ordering::SeqCst);

        tokio::spawn(async move {
            for delta in ["mock ", "stream"] {
                let chunk = StreamChunk {
                    delta: delta.into(),
                    model: model.clone(),
                    provider: provider.clone(),
                    usage: TokenUsage::default(),
                    cost: 0.0,
                    done: false,
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }

            let terminal = StreamChunk {
                delta: String::new(),
                model,
                provider,
                usage,
                cost,
                done: !omit_done,
            };
            let _ = tx.send(terminal).await;
        });

        Ok(rx)
    }

    async fn is_available(&self) -> bool {
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        self.available.load(Ordering::SeqCst)
    }

    fn count_tokens(&self, messages: &[ChatMessage]) -> Result<u32, ProviderError> {
        if self.fail_count_tokens.load(Ordering::SeqCst) {
            return Err(ProviderError::TokenCount("mock token counter failure".into()));
        }

        // Rough approximation: four characters per token.
        let chars: usize = messages.iter().map(|m| m.content.len()).sum();
        Ok((chars / 4) as u32)
    }

    fn calculate_cost(&self, usage: &TokenUsage, _model: &str) -> Result<f64, ProviderError> {
        if self.fail_calculate_cost.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("mock pricing failure".into()));
        }
        Ok(self.pricing.cost(usage))
    }
}

/// A minimal single-message request for tests.
pub fn chat_request(model: impl Into<String>, content: impl Into<String>) -> ChatRequest {
    ChatRequest::new(model, vec![ChatMessage::user(content)])
}
