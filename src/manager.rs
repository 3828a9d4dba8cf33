//! Provider manager: wires routing, health, and cost governance together
//! and executes chat requests end-to-end.
//!
//! Per request the manager runs five strictly sequential steps: select a
//! provider, gate on budget, attempt the call, walk the fallback chain on
//! failure, and record actual usage on success. Fallback attempts are
//! sequential and ordered exactly as configured — concurrent fallback
//! racing would double-bill unpredictably.

use crate::config::Config;
use crate::cost::{CostOptimizer, CostTracker, UsageStats};
use crate::error::{Error, ProviderError, Result, SelectionError};
use crate::health::{HealthChecker, ProviderHealth};
use crate::provider::{ChatRequest, ChatResponse, Provider, ProviderRegistry, StreamChunk, TokenUsage};
use crate::routing::{ProviderSelection, RoutingEngine};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Owns the provider registry and orchestrates chat requests across it.
pub struct Manager {
    registry: Arc<ProviderRegistry>,
    routing: RoutingEngine,
    health: Arc<HealthChecker>,
    cost_tracker: Arc<CostTracker>,
    shutdown: CancellationToken,
}

impl Manager {
    /// Build a manager over a fixed set of providers and start background
    /// health polling. Must be called within a Tokio runtime.
    ///
    /// The registry is read-only afterwards; providers are never added or
    /// removed at runtime.
    pub fn new(config: Config, providers: Vec<Arc<dyn Provider>>) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::new(providers)?);
        let cost_tracker = Arc::new(CostTracker::new(config.budget));
        let health = Arc::new(HealthChecker::new(config.health.check_interval));
        let optimizer = CostOptimizer::new(registry.clone());
        let routing = RoutingEngine::new(
            config.routing,
            registry.clone(),
            health.clone(),
            optimizer,
        );

        let shutdown = CancellationToken::new();
        health
            .clone()
            .spawn(registry.clone(), shutdown.child_token());

        tracing::info!(providers = registry.len(), "provider manager initialized");

        Ok(Self {
            registry,
            routing,
            health,
            cost_tracker,
            shutdown,
        })
    }

    /// Send a chat request to the best available provider, failing over
    /// along the selection's fallback chain.
    ///
    /// Terminal errors: selection failure, budget breach, cancellation, or
    /// exhaustion of the whole chain. Individual provider failures are
    /// logged per hop and only the final aggregate surfaces. Cancellation
    /// terminates the request outright — it never triggers failover — and
    /// nothing is recorded for cancelled attempts.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse> {
        let selection = self.routing.select_provider(&request)?;
        self.cost_tracker
            .check_budget(&selection.provider, selection.cost_estimate)?;

        let mut attempts = 0usize;
        let mut last_error: Option<ProviderError> = None;

        for name in self.attempt_chain(&selection) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(provider) = self.registry.get(name) else {
                tracing::debug!(provider = %name, "fallback provider not registered, skipping");
                continue;
            };

            if attempts > 0 {
                tracing::warn!(
                    original_provider = %selection.provider,
                    fallback_provider = %name,
                    "trying fallback provider"
                );
            }

            let mut attempt_request = request.clone();
            attempt_request.provider = Some(name.clone());
            attempts += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = provider.chat(attempt_request) => outcome,
            };

            match outcome {
                Ok(response) => {
                    // Actual reported usage, not the pre-flight estimate,
                    // attributed to whichever provider answered.
                    self.cost_tracker
                        .record_usage(&response.provider, &response.usage, response.cost);
                    return Ok(response);
                }
                Err(error) => {
                    tracing::warn!(provider = %name, %error, "provider attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(Error::AllProvidersFailed {
            attempts,
            last: last_error
                .unwrap_or_else(|| ProviderError::Unavailable("no provider attempted".into())),
        })
    }

    /// Streaming analogue of [`chat`](Self::chat).
    ///
    /// The fallback chain applies to stream establishment only; once chunks
    /// are flowing a failure cannot fail over (the caller has already
    /// observed output). Usage accumulates chunk-by-chunk and is recorded
    /// exactly once — on the terminal chunk, or at channel close for
    /// partial streams.
    pub async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let selection = self.routing.select_provider(&request)?;
        self.cost_tracker
            .check_budget(&selection.provider, selection.cost_estimate)?;

        let mut attempts = 0usize;
        let mut last_error: Option<ProviderError> = None;

        for name in self.attempt_chain(&selection) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(provider) = self.registry.get(name) else {
                tracing::debug!(provider = %name, "fallback provider not registered, skipping");
                continue;
            };

            let mut attempt_request = request.clone();
            attempt_request.provider = Some(name.clone());
            attempts += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = provider.chat_stream(attempt_request) => outcome,
            };

            match outcome {
                Ok(stream) => return Ok(self.track_stream(stream, name.clone())),
                Err(error) => {
                    tracing::warn!(provider = %name, %error, "streaming request failed");
                    last_error = Some(error);
                }
            }
        }

        Err(Error::AllProvidersFailed {
            attempts,
            last: last_error
                .unwrap_or_else(|| ProviderError::Unavailable("no provider attempted".into())),
        })
    }

    /// Primary followed by its fallbacks, in configured order.
    fn attempt_chain<'a>(
        &self,
        selection: &'a ProviderSelection,
    ) -> impl Iterator<Item = &'a String> {
        std::iter::once(&selection.provider).chain(selection.fallbacks.iter())
    }

    /// Forward a provider stream while accumulating usage, recording it
    /// once at termination.
    fn track_stream(
        &self,
        mut upstream: mpsc::Receiver<StreamChunk>,
        provider: String,
    ) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(32);
        let tracker = self.cost_tracker.clone();

        tokio::spawn(async move {
            let mut total = TokenUsage::default();
            let mut total_cost = 0.0;
            let mut saw_chunk = false;
            let mut recorded = false;

            while let Some(chunk) = upstream.recv().await {
                saw_chunk = true;
                total.add(&chunk.usage);
                total_cost += chunk.cost;
                let done = chunk.done;

                if tx.send(chunk).await.is_err() {
                    // Receiver dropped mid-stream; keep the accumulated
                    // totals for the final record below.
                    break;
                }

                if done && !recorded {
                    tracker.record_usage(&provider, &total, total_cost);
                    recorded = true;
                }
            }

            // Partial or cancelled stream: record whatever accumulated at
            // the point of termination, exactly once.
            if saw_chunk && !recorded {
                tracker.record_usage(&provider, &total, total_cost);
            }
        });

        rx
    }

    /// Look up a registered provider by name.
    pub fn get_provider(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| SelectionError::UnknownProvider(name.to_string()).into())
    }

    /// Registered provider names, in registration order.
    pub fn available_providers(&self) -> Vec<String> {
        self.registry.names().to_vec()
    }

    /// Copy of the current health snapshot for all providers.
    pub fn provider_health(&self) -> HashMap<String, ProviderHealth> {
        self.health.status()
    }

    /// Snapshot of the usage ledgers and budget configuration.
    pub fn usage_stats(&self) -> UsageStats {
        self.cost_tracker.stats()
    }

    /// Force an immediate health sweep outside the regular interval.
    pub async fn refresh_health(&self) {
        self.health.probe_all(&self.registry).await;
    }

    /// Stop the background health loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
