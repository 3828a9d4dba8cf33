//! Cost governance: usage ledger, budget checks, and request cost
//! estimation.
//!
//! The tracker is an append-only in-memory ledger of per-provider daily and
//! monthly usage. Budget checks are advisory (check-then-act, no
//! reservation): concurrent requests can race past the same check, which is
//! acceptable because budgets are soft limits here, not admission control.

use crate::config::BudgetConfig;
use crate::error::BudgetError;
use crate::provider::{ChatRequest, ProviderRegistry, TokenUsage};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Accumulated usage for one provider on one UTC day. Created lazily on
/// first use, mutated in place, monotonically increasing within the period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub provider: String,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
    pub last_updated: DateTime<Utc>,
}

/// Accumulated usage for one provider in one UTC month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyUsage {
    /// First day of the month.
    pub month: NaiveDate,
    pub provider: String,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
    pub last_updated: DateTime<Utc>,
}

/// Snapshot of the ledgers plus the budget configuration, for
/// observability. Deep copies; mutating it cannot touch tracker state.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub daily: HashMap<String, DailyUsage>,
    pub monthly: HashMap<String, MonthlyUsage>,
    pub budgets: BudgetConfig,
}

/// Both ledgers live under one lock so a single recording updates daily and
/// monthly totals atomically with respect to readers.
#[derive(Default)]
struct Ledger {
    daily: HashMap<String, DailyUsage>,
    monthly: HashMap<String, MonthlyUsage>,
}

/// Tracks token usage and spend across providers against configured
/// budgets.
pub struct CostTracker {
    ledger: RwLock<Ledger>,
    budgets: BudgetConfig,
}

impl CostTracker {
    pub fn new(budgets: BudgetConfig) -> Self {
        Self {
            ledger: RwLock::new(Ledger::default()),
            budgets,
        }
    }

    /// Advisory pre-flight check: would adding `estimated` to the current
    /// period spend exceed a ceiling? Inspects the ledger without reserving
    /// capacity, so concurrent requests can jointly overshoot a ceiling.
    /// A ceiling `<= 0` is disabled. Missing ledger entries count as zero
    /// spend.
    pub fn check_budget(&self, provider: &str, estimated: f64) -> Result<(), BudgetError> {
        self.check_budget_at(provider, estimated, Utc::now())
    }

    fn check_budget_at(
        &self,
        provider: &str,
        estimated: f64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetError> {
        let today = now.date_naive();
        let month = month_start(today);
        let ledger = self
            .ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let daily_spent = if self.budgets.track_by_provider {
            ledger
                .daily
                .get(&daily_key(provider, today))
                .map_or(0.0, |u| u.cost)
        } else {
            ledger
                .daily
                .values()
                .filter(|u| u.date == today)
                .map(|u| u.cost)
                .sum()
        };

        if self.budgets.daily_limit > 0.0 && daily_spent + estimated > self.budgets.daily_limit {
            return Err(BudgetError::DailyLimitExceeded {
                provider: provider.to_string(),
                spent: daily_spent,
                estimated,
                limit: self.budgets.daily_limit,
            });
        }

        let monthly_spent = if self.budgets.track_by_provider {
            ledger
                .monthly
                .get(&monthly_key(provider, month))
                .map_or(0.0, |u| u.cost)
        } else {
            ledger
                .monthly
                .values()
                .filter(|u| u.month == month)
                .map(|u| u.cost)
                .sum()
        };

        if self.budgets.monthly_budget > 0.0
            && monthly_spent + estimated > self.budgets.monthly_budget
        {
            return Err(BudgetError::MonthlyBudgetExceeded {
                provider: provider.to_string(),
                spent: monthly_spent,
                estimated,
                limit: self.budgets.monthly_budget,
            });
        }

        Ok(())
    }

    /// Record actual usage for a completed request. Accumulates into both
    /// the daily and monthly entry for the provider; safe under concurrent
    /// invocation from many in-flight requests.
    pub fn record_usage(&self, provider: &str, usage: &TokenUsage, cost: f64) {
        self.record_usage_at(provider, usage, cost, Utc::now());
    }

    fn record_usage_at(
        &self,
        provider: &str,
        usage: &TokenUsage,
        cost: f64,
        now: DateTime<Utc>,
    ) {
        let today = now.date_naive();
        let month = month_start(today);
        let tokens = u64::from(usage.total());

        let mut ledger = self
            .ledger
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let daily = ledger
            .daily
            .entry(daily_key(provider, today))
            .or_insert_with(|| DailyUsage {
                date: today,
                provider: provider.to_string(),
                requests: 0,
                tokens: 0,
                cost: 0.0,
                last_updated: now,
            });
        let daily_before = daily.cost;
        daily.requests += 1;
        daily.tokens += tokens;
        daily.cost += cost;
        daily.last_updated = now;
        let daily_after = daily.cost;

        let monthly = ledger
            .monthly
            .entry(monthly_key(provider, month))
            .or_insert_with(|| MonthlyUsage {
                month,
                provider: provider.to_string(),
                requests: 0,
                tokens: 0,
                cost: 0.0,
                last_updated: now,
            });
        let monthly_before = monthly.cost;
        monthly.requests += 1;
        monthly.tokens += tokens;
        monthly.cost += cost;
        monthly.last_updated = now;
        let monthly_after = monthly.cost;

        drop(ledger);

        if crossed_threshold(
            daily_before,
            daily_after,
            self.budgets.alert_threshold,
            self.budgets.daily_limit,
        ) {
            tracing::warn!(
                provider,
                spent = daily_after,
                limit = self.budgets.daily_limit,
                "daily spend crossed alert threshold"
            );
        }
        if crossed_threshold(
            monthly_before,
            monthly_after,
            self.budgets.alert_threshold,
            self.budgets.monthly_budget,
        ) {
            tracing::warn!(
                provider,
                spent = monthly_after,
                limit = self.budgets.monthly_budget,
                "monthly spend crossed alert threshold"
            );
        }
    }

    /// Deep-copied snapshot of both ledgers and the budget configuration.
    pub fn stats(&self) -> UsageStats {
        let ledger = self
            .ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        UsageStats {
            daily: ledger.daily.clone(),
            monthly: ledger.monthly.clone(),
            budgets: self.budgets.clone(),
        }
    }
}

/// Period keys are derived from UTC-truncated wall-clock time so a request
/// near midnight in any local timezone never double-counts.
fn daily_key(provider: &str, date: NaiveDate) -> String {
    format!("{provider}:{}", date.format("%Y-%m-%d"))
}

fn monthly_key(provider: &str, month: NaiveDate) -> String {
    format!("{provider}:{}", month.format("%Y-%m"))
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Whether an accumulation moved spend from below to at-or-above the alert
/// fraction of a ceiling. Disabled ceilings and thresholds never fire.
fn crossed_threshold(before: f64, after: f64, threshold: f64, limit: f64) -> bool {
    if limit <= 0.0 || threshold <= 0.0 {
        return false;
    }
    let mark = threshold * limit;
    before < mark && after >= mark
}

/// Stateless estimator for the monetary cost of a candidate request against
/// a candidate provider.
///
/// Estimation is advisory and must never block a request: every internal
/// failure degrades to a zero estimate, logged but not returned.
#[derive(Clone)]
pub struct CostOptimizer {
    registry: Arc<ProviderRegistry>,
}

impl CostOptimizer {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Estimate the USD cost of `request` on `provider_name`.
    ///
    /// Input size comes from the provider's token counter; output size is
    /// the request's `max_tokens` when set, otherwise half the input
    /// estimate.
    pub fn estimate_cost(&self, provider_name: &str, request: &ChatRequest) -> f64 {
        let Some(provider) = self.registry.get(provider_name) else {
            return 0.0;
        };

        let prompt_tokens = match provider.count_tokens(&request.messages) {
            Ok(tokens) => tokens,
            Err(error) => {
                tracing::warn!(
                    provider = %provider_name,
                    %error,
                    "token count failed during cost estimation"
                );
                return 0.0;
            }
        };

        let completion_tokens = request.max_tokens.unwrap_or(prompt_tokens / 2);
        let usage = TokenUsage::new(prompt_tokens, completion_tokens);

        match provider.calculate_cost(&usage, &request.model) {
            Ok(cost) => cost,
            Err(error) => {
                tracing::warn!(
                    provider = %provider_name,
                    model = %request.model,
                    %error,
                    "cost calculation failed during estimation"
                );
                0.0
            }
        }
    }

    /// Blended per-1K-token figure for a provider/model, assuming the 70/30
    /// input/output split used for rough estimates. `None` when the
    /// provider is unknown or cannot price the model.
    pub fn cost_per_1k(&self, provider_name: &str, model: &str) -> Option<f64> {
        let provider = self.registry.get(provider_name)?;
        provider
            .calculate_cost(&TokenUsage::new(700, 300), model)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ModelPricing, Provider};
    use crate::test_utils::MockProvider;
    use chrono::TimeZone;

    fn budgets(daily: f64, monthly: f64) -> BudgetConfig {
        BudgetConfig {
            monthly_budget: monthly,
            daily_limit: daily,
            alert_threshold: 0.8,
            track_by_provider: true,
        }
    }

    #[test]
    fn recording_accumulates_both_ledgers() {
        let tracker = CostTracker::new(budgets(100.0, 1000.0));
        tracker.record_usage("claude", &TokenUsage::new(100, 50), 0.5);
        tracker.record_usage("claude", &TokenUsage::new(200, 100), 1.0);

        let stats = tracker.stats();
        assert_eq!(stats.daily.len(), 1);
        assert_eq!(stats.monthly.len(), 1);

        let daily = stats.daily.values().next().unwrap();
        assert_eq!(daily.requests, 2);
        assert_eq!(daily.tokens, 450);
        assert!((daily.cost - 1.5).abs() < 1e-10);

        let monthly = stats.monthly.values().next().unwrap();
        assert_eq!(monthly.requests, 2);
        assert_eq!(monthly.tokens, 450);
        assert!((monthly.cost - 1.5).abs() < 1e-10);
    }

    #[test]
    fn recording_order_does_not_matter() {
        let forward = CostTracker::new(budgets(100.0, 1000.0));
        forward.record_usage("claude", &TokenUsage::new(10, 5), 0.25);
        forward.record_usage("claude", &TokenUsage::new(30, 15), 0.75);

        let reverse = CostTracker::new(budgets(100.0, 1000.0));
        reverse.record_usage("claude", &TokenUsage::new(30, 15), 0.75);
        reverse.record_usage("claude", &TokenUsage::new(10, 5), 0.25);

        let a = forward.stats();
        let b = reverse.stats();
        let daily_a = a.daily.values().next().unwrap();
        let daily_b = b.daily.values().next().unwrap();
        assert_eq!(daily_a.requests, daily_b.requests);
        assert_eq!(daily_a.tokens, daily_b.tokens);
        assert!((daily_a.cost - daily_b.cost).abs() < 1e-10);
    }

    #[test]
    fn concurrent_recording_loses_nothing() {
        let tracker = Arc::new(CostTracker::new(budgets(0.0, 0.0)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    tracker.record_usage("claude", &TokenUsage::new(10, 5), 0.01);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = tracker.stats();
        let daily = stats.daily.values().next().unwrap();
        assert_eq!(daily.requests, 800);
        assert_eq!(daily.tokens, 800 * 15);
        assert!((daily.cost - 8.0).abs() < 1e-6);
    }

    #[test]
    fn daily_limit_rejects_when_estimate_would_exceed() {
        let tracker = CostTracker::new(budgets(10.0, 1000.0));
        tracker.record_usage("claude", &TokenUsage::new(1000, 500), 9.5);

        let result = tracker.check_budget("claude", 1.0);
        assert!(matches!(
            result,
            Err(BudgetError::DailyLimitExceeded { ref provider, limit, .. })
                if provider == "claude" && limit == 10.0
        ));

        assert!(tracker.check_budget("claude", 0.4).is_ok());
    }

    #[test]
    fn monthly_budget_rejects_independently_of_daily() {
        let tracker = CostTracker::new(budgets(1000.0, 20.0));
        tracker.record_usage("claude", &TokenUsage::new(1000, 500), 19.5);

        assert!(matches!(
            tracker.check_budget("claude", 1.0),
            Err(BudgetError::MonthlyBudgetExceeded { .. })
        ));
    }

    #[test]
    fn empty_ledger_counts_as_zero_spend() {
        let tracker = CostTracker::new(budgets(10.0, 100.0));
        assert!(tracker.check_budget("claude", 9.0).is_ok());
        assert!(tracker.check_budget("claude", 11.0).is_err());
    }

    #[test]
    fn zero_ceilings_disable_checks() {
        let tracker = CostTracker::new(budgets(0.0, 0.0));
        tracker.record_usage("claude", &TokenUsage::new(1000, 500), 1_000_000.0);
        assert!(tracker.check_budget("claude", 1_000_000.0).is_ok());
    }

    #[test]
    fn budgets_only_gate_the_named_provider_when_tracking_per_provider() {
        let tracker = CostTracker::new(budgets(10.0, 1000.0));
        tracker.record_usage("claude", &TokenUsage::new(1000, 500), 9.5);

        assert!(tracker.check_budget("openai", 1.0).is_ok());
    }

    #[test]
    fn global_tracking_sums_across_providers() {
        let tracker = CostTracker::new(BudgetConfig {
            monthly_budget: 1000.0,
            daily_limit: 10.0,
            alert_threshold: 0.8,
            track_by_provider: false,
        });
        tracker.record_usage("claude", &TokenUsage::new(10, 5), 6.0);
        tracker.record_usage("openai", &TokenUsage::new(10, 5), 3.5);

        assert!(matches!(
            tracker.check_budget("gemini", 1.0),
            Err(BudgetError::DailyLimitExceeded { .. })
        ));
        assert!(tracker.check_budget("gemini", 0.4).is_ok());
    }

    #[test]
    fn periods_truncate_in_utc() {
        let tracker = CostTracker::new(budgets(0.0, 0.0));
        let day_one = Utc.with_ymd_and_hms(2026, 8, 5, 23, 59, 0).unwrap();
        let day_two = Utc.with_ymd_and_hms(2026, 8, 6, 0, 1, 0).unwrap();

        tracker.record_usage_at("claude", &TokenUsage::new(10, 5), 0.5, day_one);
        tracker.record_usage_at("claude", &TokenUsage::new(10, 5), 0.5, day_two);

        let stats = tracker.stats();
        // Two distinct days, one month.
        assert_eq!(stats.daily.len(), 2);
        assert_eq!(stats.monthly.len(), 1);
        let monthly = stats.monthly.values().next().unwrap();
        assert_eq!(monthly.requests, 2);
        assert_eq!(monthly.month, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
    }

    #[test]
    fn alert_threshold_crossing_detection() {
        // Fires exactly when spend moves from below to at-or-above the mark.
        assert!(crossed_threshold(7.9, 8.0, 0.8, 10.0));
        assert!(crossed_threshold(0.0, 9.0, 0.8, 10.0));
        assert!(!crossed_threshold(8.0, 9.0, 0.8, 10.0));
        assert!(!crossed_threshold(1.0, 2.0, 0.8, 10.0));
        assert!(!crossed_threshold(7.9, 8.0, 0.0, 10.0));
        assert!(!crossed_threshold(7.9, 8.0, 0.8, 0.0));
    }

    fn optimizer_with(provider: Arc<MockProvider>) -> CostOptimizer {
        let registry = Arc::new(
            ProviderRegistry::new(vec![provider as Arc<dyn Provider>]).unwrap(),
        );
        CostOptimizer::new(registry)
    }

    fn request_with_content(content: &str) -> ChatRequest {
        ChatRequest::new("claude-3-5-sonnet", vec![ChatMessage::user(content)])
    }

    #[test]
    fn estimate_uses_max_tokens_as_output_size() {
        let pricing = ModelPricing {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
        };
        let provider = Arc::new(MockProvider::new("claude").with_pricing(pricing));
        let optimizer = optimizer_with(provider);

        // 400 chars -> 100 prompt tokens under the mock's 4-chars-per-token
        // approximation.
        let request = request_with_content(&"x".repeat(400)).with_max_tokens(200);
        let expected = pricing.cost(&TokenUsage::new(100, 200));
        let estimate = optimizer.estimate_cost("claude", &request);
        assert!((estimate - expected).abs() < 1e-10);
    }

    #[test]
    fn estimate_defaults_output_to_half_the_input() {
        let pricing = ModelPricing {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
        };
        let provider = Arc::new(MockProvider::new("claude").with_pricing(pricing));
        let optimizer = optimizer_with(provider);

        let request = request_with_content(&"x".repeat(400));
        let expected = pricing.cost(&TokenUsage::new(100, 50));
        let estimate = optimizer.estimate_cost("claude", &request);
        assert!((estimate - expected).abs() < 1e-10);
    }

    #[test]
    fn estimation_failures_degrade_to_zero() {
        let optimizer = optimizer_with(Arc::new(MockProvider::new("claude")));
        assert_eq!(
            optimizer.estimate_cost("gemini", &request_with_content("hi")),
            0.0
        );

        let broken = Arc::new(MockProvider::new("claude"));
        broken.set_fail_count_tokens(true);
        let optimizer = optimizer_with(broken);
        assert_eq!(
            optimizer.estimate_cost("claude", &request_with_content("hi")),
            0.0
        );

        let unpriceable = Arc::new(MockProvider::new("claude"));
        unpriceable.set_fail_calculate_cost(true);
        let optimizer = optimizer_with(unpriceable);
        assert_eq!(
            optimizer.estimate_cost("claude", &request_with_content("hi")),
            0.0
        );
    }

    #[test]
    fn cost_per_1k_reflects_provider_pricing() {
        let cheap = optimizer_with(Arc::new(MockProvider::new("cheap").with_pricing(
            ModelPricing {
                input_per_1k: 0.0,
                output_per_1k: 0.0,
            },
        )));
        assert_eq!(cheap.cost_per_1k("cheap", "llama3.2"), Some(0.0));

        let pricey = optimizer_with(Arc::new(MockProvider::new("pricey").with_pricing(
            ModelPricing {
                input_per_1k: 10.0,
                output_per_1k: 10.0,
            },
        )));
        let per_1k = pricey.cost_per_1k("pricey", "gpt-4o").unwrap();
        assert!((per_1k - 10.0).abs() < 1e-10);

        assert_eq!(pricey.cost_per_1k("missing", "gpt-4o"), None);
    }
}
