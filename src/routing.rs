//! Rule-based provider selection.
//!
//! Rules are static configuration: an immutable ordered list of value
//! objects evaluated as a matching *set* against each request. Every
//! matching rule contributes a candidate; the highest-priority candidate
//! whose provider is currently healthy wins, with ties broken by
//! first-seen order so selection is reproducible.

use crate::config::RoutingConfig;
use crate::cost::CostOptimizer;
use crate::error::SelectionError;
use crate::health::HealthChecker;
use crate::provider::{ChatRequest, ProviderRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Declarative predicate over a request. All set fields must hold for the
/// rule to match (conjunctive matching); an empty condition matches every
/// request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingCondition {
    /// Request must declare tool definitions.
    #[serde(default)]
    pub requires_functions: bool,

    /// Some message must carry image content.
    #[serde(default)]
    pub requires_images: bool,

    /// Request must ask for extended-thinking mode.
    #[serde(default)]
    pub requires_thinking: bool,

    /// Target provider's blended per-1K cost for the request's model must
    /// not exceed this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_1k: Option<f64>,

    /// Target provider's context window for the request's model must be at
    /// least this many tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_token_limit: Option<u32>,

    /// When non-empty, the rule only applies if its target provider is in
    /// this list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_providers: Vec<String>,
}

/// Pairs a condition with a target provider, a priority (higher wins), and
/// a human-readable explanation for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub condition: RoutingCondition,
    pub provider: String,
    pub priority: u32,
    pub explanation: String,
}

/// Result of provider routing. Constructed fresh per request, never
/// mutated after return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub provider: String,
    pub reasoning: String,

    /// Derived from rule priority (priority / 100); 1.0 for explicit
    /// overrides, 0.5 for default selection.
    pub confidence: f64,

    /// Ordered fallback chain to walk if the provider fails.
    pub fallbacks: Vec<String>,

    /// Estimated cost in USD for this specific request.
    pub cost_estimate: f64,
}

/// Evaluates routing rules and resolves fallback chains.
pub struct RoutingEngine {
    rules: Vec<RoutingRule>,
    fallbacks: HashMap<String, Vec<String>>,
    default_provider: Option<String>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthChecker>,
    optimizer: CostOptimizer,
}

impl RoutingEngine {
    pub fn new(
        config: RoutingConfig,
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthChecker>,
        optimizer: CostOptimizer,
    ) -> Self {
        Self {
            rules: config.rules,
            fallbacks: config.fallbacks,
            default_provider: config.default_provider,
            registry,
            health,
            optimizer,
        }
    }

    /// Select the best provider for a request.
    ///
    /// An explicit override on the request short-circuits rule evaluation
    /// entirely; health is consulted later, at attempt time. Otherwise all
    /// matching rules become candidates, filtered by live health. Errors
    /// are terminal: the caller cannot retry without reconfiguration.
    pub fn select_provider(
        &self,
        request: &ChatRequest,
    ) -> Result<ProviderSelection, SelectionError> {
        if let Some(name) = &request.provider {
            if !self.registry.contains(name) {
                return Err(SelectionError::UnknownProvider(name.clone()));
            }
            let mut selection = ProviderSelection {
                provider: name.clone(),
                reasoning: "explicitly requested".into(),
                confidence: 1.0,
                fallbacks: self.fallback_chain(name),
                cost_estimate: 0.0,
            };
            selection.cost_estimate = self.optimizer.estimate_cost(name, request);
            return Ok(selection);
        }

        let mut candidates: Vec<ProviderSelection> = Vec::new();
        for rule in &self.rules {
            if !self.registry.contains(&rule.provider) {
                tracing::debug!(
                    provider = %rule.provider,
                    "routing rule targets unregistered provider, skipping"
                );
                continue;
            }
            if self.rule_matches(&rule.condition, &rule.provider, request) {
                candidates.push(ProviderSelection {
                    provider: rule.provider.clone(),
                    reasoning: rule.explanation.clone(),
                    confidence: f64::from(rule.priority) / 100.0,
                    fallbacks: self.fallback_chain(&rule.provider),
                    cost_estimate: 0.0,
                });
            }
        }

        if candidates.is_empty() {
            return self.select_default(request);
        }

        // Highest confidence among healthy candidates; strict comparison
        // keeps the first-seen candidate on ties.
        let mut best: Option<&ProviderSelection> = None;
        for candidate in &candidates {
            if !self.health.is_healthy(&candidate.provider) {
                continue;
            }
            if best.is_none_or(|b| candidate.confidence > b.confidence) {
                best = Some(candidate);
            }
        }

        let Some(best) = best else {
            // Every matched provider is down. Degrade to default selection
            // rather than failing while healthy providers exist.
            return self.select_default(request);
        };

        let mut selection = best.clone();
        selection.cost_estimate = self.optimizer.estimate_cost(&selection.provider, request);
        tracing::debug!(
            provider = %selection.provider,
            confidence = selection.confidence,
            cost_estimate = selection.cost_estimate,
            reasoning = %selection.reasoning,
            "selected provider"
        );
        Ok(selection)
    }

    /// Conjunctive condition check. Request-facing flags are checked
    /// against the request; provider-facing constraints against the rule's
    /// target provider.
    fn rule_matches(
        &self,
        condition: &RoutingCondition,
        provider: &str,
        request: &ChatRequest,
    ) -> bool {
        if condition.requires_functions && request.tools.is_empty() {
            return false;
        }

        if condition.requires_images && !request.has_images() {
            return false;
        }

        if condition.requires_thinking && !request.thinking {
            return false;
        }

        if let Some(min) = condition.min_token_limit
            && let Some(p) = self.registry.get(provider)
            && p.token_limit(&request.model) < min
        {
            return false;
        }

        if let Some(max) = condition.max_cost_per_1k {
            // Unknown pricing cannot satisfy a cost ceiling.
            match self.optimizer.cost_per_1k(provider, &request.model) {
                Some(per_1k) if per_1k <= max => {}
                _ => return false,
            }
        }

        if !condition.preferred_providers.is_empty()
            && !condition.preferred_providers.iter().any(|p| p == provider)
        {
            return false;
        }

        true
    }

    /// Default selection when no rule matched: the first healthy provider
    /// in registration order (configured default first, if healthy), with
    /// confidence 0.5.
    fn select_default(
        &self,
        request: &ChatRequest,
    ) -> Result<ProviderSelection, SelectionError> {
        let configured = self
            .default_provider
            .as_deref()
            .filter(|name| self.registry.contains(name) && self.health.is_healthy(name));

        let chosen = match configured {
            Some(name) => Some(name),
            None => self
                .registry
                .names()
                .iter()
                .map(String::as_str)
                .find(|name| self.health.is_healthy(name)),
        };

        let Some(name) = chosen else {
            return Err(SelectionError::NoHealthyProviders);
        };

        Ok(ProviderSelection {
            provider: name.to_string(),
            reasoning: "default provider selection".into(),
            confidence: 0.5,
            fallbacks: self.fallback_chain(name),
            cost_estimate: self.optimizer.estimate_cost(name, request),
        })
    }

    fn fallback_chain(&self, provider: &str) -> Vec<String> {
        self.fallbacks.get(provider).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ModelPricing, Provider};
    use crate::test_utils::MockProvider;

    async fn engine_with(
        config: RoutingConfig,
        providers: Vec<Arc<MockProvider>>,
    ) -> RoutingEngine {
        let registry = Arc::new(
            ProviderRegistry::new(
                providers
                    .iter()
                    .map(|p| p.clone() as Arc<dyn Provider>)
                    .collect(),
            )
            .unwrap(),
        );
        let health = Arc::new(HealthChecker::new(std::time::Duration::from_secs(300)));
        health.probe_all(&registry).await;
        RoutingEngine::new(
            config,
            registry.clone(),
            health,
            CostOptimizer::new(registry),
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::new("claude-3-5-sonnet", vec![ChatMessage::user("hello")])
    }

    fn rule(provider: &str, priority: u32, condition: RoutingCondition) -> RoutingRule {
        RoutingRule {
            condition,
            provider: provider.into(),
            priority,
            explanation: format!("{provider} rule"),
        }
    }

    fn config_with_rules(rules: Vec<RoutingRule>) -> RoutingConfig {
        RoutingConfig {
            rules,
            fallbacks: HashMap::from([("openai".into(), vec!["claude".into()])]),
            default_provider: None,
        }
    }

    #[tokio::test]
    async fn explicit_override_short_circuits_rules() {
        // The pinned provider wins with confidence 1.0 even though it is
        // unhealthy and a rule points elsewhere.
        let openai = Arc::new(MockProvider::new("openai"));
        let claude = Arc::new(MockProvider::new("claude"));
        claude.set_available(false);

        let engine = engine_with(
            config_with_rules(vec![rule("openai", 100, RoutingCondition::default())]),
            vec![openai, claude.clone()],
        )
        .await;

        let selection = engine
            .select_provider(&request().with_provider("claude"))
            .unwrap();
        assert_eq!(selection.provider, "claude");
        assert_eq!(selection.confidence, 1.0);
    }

    #[tokio::test]
    async fn override_carries_configured_fallbacks() {
        let engine = engine_with(
            config_with_rules(Vec::new()),
            vec![
                Arc::new(MockProvider::new("openai")),
                Arc::new(MockProvider::new("claude")),
            ],
        )
        .await;

        let selection = engine
            .select_provider(&request().with_provider("openai"))
            .unwrap();
        assert_eq!(selection.fallbacks, vec!["claude".to_string()]);
    }

    #[tokio::test]
    async fn unknown_override_is_a_selection_error() {
        let engine = engine_with(
            config_with_rules(Vec::new()),
            vec![Arc::new(MockProvider::new("openai"))],
        )
        .await;

        let result = engine.select_provider(&request().with_provider("gemini"));
        assert!(matches!(
            result,
            Err(SelectionError::UnknownProvider(name)) if name == "gemini"
        ));
    }

    #[tokio::test]
    async fn no_rules_picks_first_healthy_in_registration_order() {
        let openai = Arc::new(MockProvider::new("openai"));
        let claude = Arc::new(MockProvider::new("claude"));
        claude.set_available(false);

        let engine = engine_with(
            config_with_rules(Vec::new()),
            vec![claude.clone(), openai],
        )
        .await;

        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "openai");
        assert_eq!(selection.confidence, 0.5);
    }

    #[tokio::test]
    async fn no_healthy_providers_fails() {
        let openai = Arc::new(MockProvider::new("openai"));
        openai.set_available(false);

        let engine = engine_with(config_with_rules(Vec::new()), vec![openai]).await;
        assert!(matches!(
            engine.select_provider(&request()),
            Err(SelectionError::NoHealthyProviders)
        ));
    }

    #[tokio::test]
    async fn function_rule_requires_declared_tools() {
        let engine = engine_with(
            config_with_rules(vec![rule(
                "openai",
                100,
                RoutingCondition {
                    requires_functions: true,
                    ..Default::default()
                },
            )]),
            vec![
                Arc::new(MockProvider::new("claude")),
                Arc::new(MockProvider::new("openai")),
            ],
        )
        .await;

        // No tools declared: the rule must not match, default selection
        // picks the first registered provider.
        let plain = engine.select_provider(&request()).unwrap();
        assert_eq!(plain.provider, "claude");
        assert_eq!(plain.confidence, 0.5);

        let with_tools = engine
            .select_provider(&request().with_tools(vec![serde_json::json!({"name": "grep"})]))
            .unwrap();
        assert_eq!(with_tools.provider, "openai");
        assert_eq!(with_tools.confidence, 1.0);
    }

    #[tokio::test]
    async fn only_matching_rules_become_candidates() {
        // tools set, thinking not: the thinking rule must not fire even
        // though its provider is healthy.
        let engine = engine_with(
            config_with_rules(vec![
                rule(
                    "openai",
                    100,
                    RoutingCondition {
                        requires_functions: true,
                        ..Default::default()
                    },
                ),
                rule(
                    "claude",
                    90,
                    RoutingCondition {
                        requires_thinking: true,
                        ..Default::default()
                    },
                ),
            ]),
            vec![
                Arc::new(MockProvider::new("openai")),
                Arc::new(MockProvider::new("claude")),
            ],
        )
        .await;

        let selection = engine
            .select_provider(&request().with_tools(vec![serde_json::json!({"name": "grep"})]))
            .unwrap();
        assert_eq!(selection.provider, "openai");
        assert_eq!(selection.confidence, 1.0);
    }

    #[tokio::test]
    async fn image_rule_requires_image_content() {
        let engine = engine_with(
            config_with_rules(vec![rule(
                "gemini",
                85,
                RoutingCondition {
                    requires_images: true,
                    ..Default::default()
                },
            )]),
            vec![
                Arc::new(MockProvider::new("openai")),
                Arc::new(MockProvider::new("gemini")),
            ],
        )
        .await;

        let plain = engine.select_provider(&request()).unwrap();
        assert_eq!(plain.provider, "openai");

        let imaged = engine
            .select_provider(&ChatRequest::new(
                "gemini-1.5-pro",
                vec![ChatMessage::user_with_images("what is this", vec!["img".into()])],
            ))
            .unwrap();
        assert_eq!(imaged.provider, "gemini");
    }

    #[tokio::test]
    async fn higher_priority_wins_and_ties_keep_first_seen() {
        let engine = engine_with(
            config_with_rules(vec![
                rule("claude", 90, RoutingCondition::default()),
                rule("openai", 100, RoutingCondition::default()),
                rule("gemini", 100, RoutingCondition::default()),
            ]),
            vec![
                Arc::new(MockProvider::new("openai")),
                Arc::new(MockProvider::new("claude")),
                Arc::new(MockProvider::new("gemini")),
            ],
        )
        .await;

        // openai and gemini tie at 100; openai appeared first.
        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "openai");
    }

    #[tokio::test]
    async fn unhealthy_match_degrades_to_default_selection() {
        let openai = Arc::new(MockProvider::new("openai"));
        openai.set_available(false);

        let engine = engine_with(
            config_with_rules(vec![rule("openai", 100, RoutingCondition::default())]),
            vec![openai, Arc::new(MockProvider::new("claude"))],
        )
        .await;

        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "claude");
        assert_eq!(selection.confidence, 0.5);
    }

    #[tokio::test]
    async fn min_token_limit_excludes_small_context_providers() {
        let small = Arc::new(MockProvider::new("small").with_token_limit(8_192));
        let large = Arc::new(MockProvider::new("large").with_token_limit(200_000));

        let engine = engine_with(
            config_with_rules(vec![
                rule(
                    "small",
                    100,
                    RoutingCondition {
                        min_token_limit: Some(100_000),
                        ..Default::default()
                    },
                ),
                rule(
                    "large",
                    90,
                    RoutingCondition {
                        min_token_limit: Some(100_000),
                        ..Default::default()
                    },
                ),
            ]),
            vec![small, large],
        )
        .await;

        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "large");
    }

    #[tokio::test]
    async fn max_cost_rule_excludes_expensive_providers() {
        let pricey = Arc::new(MockProvider::new("pricey").with_pricing(ModelPricing {
            input_per_1k: 0.05,
            output_per_1k: 0.10,
        }));
        let cheap = Arc::new(MockProvider::new("cheap").with_pricing(ModelPricing {
            input_per_1k: 0.0,
            output_per_1k: 0.0,
        }));

        let engine = engine_with(
            config_with_rules(vec![
                rule(
                    "pricey",
                    100,
                    RoutingCondition {
                        max_cost_per_1k: Some(0.01),
                        ..Default::default()
                    },
                ),
                rule(
                    "cheap",
                    90,
                    RoutingCondition {
                        max_cost_per_1k: Some(0.01),
                        ..Default::default()
                    },
                ),
            ]),
            vec![pricey, cheap],
        )
        .await;

        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "cheap");
    }

    #[tokio::test]
    async fn preferred_providers_gate_the_rule() {
        let engine = engine_with(
            config_with_rules(vec![rule(
                "openai",
                100,
                RoutingCondition {
                    preferred_providers: vec!["claude".into()],
                    ..Default::default()
                },
            )]),
            vec![
                Arc::new(MockProvider::new("claude")),
                Arc::new(MockProvider::new("openai")),
            ],
        )
        .await;

        // openai is not in the rule's preferred list: rule never matches.
        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "claude");
        assert_eq!(selection.confidence, 0.5);
    }

    #[tokio::test]
    async fn rule_for_unregistered_provider_is_ignored() {
        let engine = engine_with(
            config_with_rules(vec![rule("gemini", 100, RoutingCondition::default())]),
            vec![Arc::new(MockProvider::new("openai"))],
        )
        .await;

        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "openai");
    }

    #[tokio::test]
    async fn configured_default_provider_is_preferred_when_healthy() {
        let engine = engine_with(
            RoutingConfig {
                rules: Vec::new(),
                fallbacks: HashMap::new(),
                default_provider: Some("claude".into()),
            },
            vec![
                Arc::new(MockProvider::new("openai")),
                Arc::new(MockProvider::new("claude")),
            ],
        )
        .await;

        let selection = engine.select_provider(&request()).unwrap();
        assert_eq!(selection.provider, "claude");
    }

    #[tokio::test]
    async fn selection_carries_cost_estimate() {
        let provider = Arc::new(MockProvider::new("openai").with_pricing(ModelPricing {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
        }));

        let engine = engine_with(
            config_with_rules(vec![rule("openai", 100, RoutingCondition::default())]),
            vec![provider],
        )
        .await;

        let selection = engine.select_provider(&request()).unwrap();
        assert!(selection.cost_estimate > 0.0);
    }
}
