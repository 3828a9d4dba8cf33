//! Configuration for the routing core.
//!
//! All configuration is supplied at construction by the embedding
//! application; nothing here parses config files. `Config::default()`
//! gives a stock rule set that routes by capability, and `from_env`
//! applies environment overrides for the budget and health knobs.

use crate::error::{ConfigError, Result};
use crate::routing::{RoutingCondition, RoutingRule};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Spending limits. Ceilings `<= 0` disable the corresponding check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Monthly budget ceiling in USD.
    pub monthly_budget: f64,

    /// Daily limit ceiling in USD.
    pub daily_limit: f64,

    /// Fraction of a ceiling at which a warning is logged (0.0 disables).
    pub alert_threshold: f64,

    /// Enforce ceilings per provider rather than over global spend.
    pub track_by_provider: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_budget: 100.0,
            daily_limit: 10.0,
            alert_threshold: 0.8,
            track_by_provider: true,
        }
    }
}

/// Health checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between availability sweeps.
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
        }
    }
}

/// Routing rules and fallback chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Evaluated as a set: every matching rule contributes a candidate.
    pub rules: Vec<RoutingRule>,

    /// Ordered alternate providers to try after a primary failure.
    pub fallbacks: HashMap<String, Vec<String>>,

    /// Preferred provider when no rule matches, if healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            fallbacks: default_fallbacks(),
            default_provider: None,
        }
    }
}

/// Aggregate configuration for the manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub routing: RoutingConfig,
    pub budget: BudgetConfig,
    pub health: HealthConfig,
}

impl Config {
    /// Defaults with environment overrides applied:
    /// `SWITCHBOARD_DAILY_LIMIT`, `SWITCHBOARD_MONTHLY_BUDGET`,
    /// `SWITCHBOARD_HEALTH_INTERVAL_SECS`, `SWITCHBOARD_DEFAULT_PROVIDER`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("SWITCHBOARD_DAILY_LIMIT") {
            config.budget.daily_limit = parse_env("SWITCHBOARD_DAILY_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("SWITCHBOARD_MONTHLY_BUDGET") {
            config.budget.monthly_budget = parse_env("SWITCHBOARD_MONTHLY_BUDGET", &raw)?;
        }
        if let Some(raw) = lookup("SWITCHBOARD_HEALTH_INTERVAL_SECS") {
            let secs: u64 = parse_env("SWITCHBOARD_HEALTH_INTERVAL_SECS", &raw)?;
            config.health.check_interval = Duration::from_secs(secs);
        }
        if let Some(provider) = lookup("SWITCHBOARD_DEFAULT_PROVIDER") {
            config.routing.default_provider = Some(provider);
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse {raw:?}")).into())
}

/// Stock capability-based rule set.
fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule {
            condition: RoutingCondition {
                requires_functions: true,
                ..Default::default()
            },
            provider: "openai".into(),
            priority: 100,
            explanation: "OpenAI has excellent function calling support".into(),
        },
        RoutingRule {
            condition: RoutingCondition {
                requires_thinking: true,
                ..Default::default()
            },
            provider: "claude".into(),
            priority: 90,
            explanation: "Claude supports thinking mode".into(),
        },
        RoutingRule {
            condition: RoutingCondition {
                requires_images: true,
                ..Default::default()
            },
            provider: "gemini".into(),
            priority: 85,
            explanation: "Gemini has strong multimodal capabilities".into(),
        },
        RoutingRule {
            condition: RoutingCondition {
                max_cost_per_1k: Some(0.01),
                ..Default::default()
            },
            provider: "ollama".into(),
            priority: 80,
            explanation: "Ollama is free for local inference".into(),
        },
    ]
}

/// Every stock provider falls back to the other three, quality-first.
fn default_fallbacks() -> HashMap<String, Vec<String>> {
    HashMap::from([
        (
            "openai".into(),
            vec!["claude".into(), "gemini".into(), "ollama".into()],
        ),
        (
            "claude".into(),
            vec!["openai".into(), "gemini".into(), "ollama".into()],
        ),
        (
            "gemini".into(),
            vec!["openai".into(), "claude".into(), "ollama".into()],
        ),
        (
            "ollama".into(),
            vec!["openai".into(), "claude".into(), "gemini".into()],
        ),
    ])
}
