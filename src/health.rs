//! Background provider health monitoring.
//!
//! A long-lived loop probes every registered provider on a fixed interval
//! and keeps a lock-free snapshot of the results. Routing reads the *last
//! known* snapshot instead of pinging per request — a bounded staleness
//! window (at most one check interval) traded for request-path latency.
//!
//! The snapshot lives in an `ArcSwap`: readers load a consistent map with
//! no lock, and each probe installs its result with an RCU map swap, so a
//! reader can never observe a half-written health record and a slow probe
//! never delays another provider's update.

use crate::provider::ProviderRegistry;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Last known health of one provider. Overwritten, not appended, on each
/// check cycle; readers always receive copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub available: bool,
    pub last_checked: DateTime<Utc>,
    pub latency: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Monitors provider availability and latency.
pub struct HealthChecker {
    snapshot: ArcSwap<HashMap<String, ProviderHealth>>,
    check_interval: Duration,
}

impl HealthChecker {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            check_interval,
        }
    }

    /// Start the background polling loop. The first sweep runs immediately
    /// so routing has a snapshot before the first interval elapses; after
    /// that, one sweep per interval. Cancel the token to stop.
    pub fn spawn(
        self: Arc<Self>,
        registry: Arc<ProviderRegistry>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            // Skip catch-up ticks if a sweep overruns the interval.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("health checker stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.probe_all(&registry).await;
                    }
                }
            }
        })
    }

    /// Probe every registered provider concurrently. Each result is
    /// installed independently as its probe completes; a failing probe for
    /// one provider never touches another's record.
    pub async fn probe_all(&self, registry: &ProviderRegistry) {
        let probes = registry.names().iter().filter_map(|name| {
            let provider = registry.get(name)?.clone();
            Some(async move {
                let start = Instant::now();
                let available = provider.is_available().await;
                let latency = start.elapsed();

                let health = ProviderHealth {
                    provider: name.clone(),
                    available,
                    last_checked: Utc::now(),
                    latency,
                    error: (!available).then(|| "provider unavailable".to_string()),
                };

                if !available {
                    tracing::warn!(provider = %name, ?latency, "provider health check failed");
                }

                self.install(health);
            })
        });

        futures::future::join_all(probes).await;
    }

    fn install(&self, health: ProviderHealth) {
        self.snapshot.rcu(|snapshot| {
            let mut next = HashMap::clone(snapshot);
            next.insert(health.provider.clone(), health.clone());
            next
        });
    }

    /// Copy of the current health snapshot.
    pub fn status(&self) -> HashMap<String, ProviderHealth> {
        HashMap::clone(&self.snapshot.load())
    }

    /// Names of providers whose last probe succeeded, sorted for stable
    /// output.
    pub fn healthy_providers(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut healthy: Vec<String> = snapshot
            .values()
            .filter(|h| h.available)
            .map(|h| h.provider.clone())
            .collect();
        healthy.sort();
        healthy
    }

    /// Whether a provider's last probe succeeded. Providers never probed
    /// yet count as unhealthy.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.snapshot.load().get(name).is_some_and(|h| h.available)
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }
}
