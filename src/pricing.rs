//! Best-effort per-1K-token pricing estimates.
//!
//! Maps model names to per-1K USD rates. These are approximate — actual
//! costs depend on provider agreements, caching, and batching. Unknown
//! models fall back to a conservative default. Shared helpers are free
//! functions so concrete providers can build their `calculate_cost` on top
//! without inheriting anything.

use crate::provider::{ModelPricing, TokenUsage};

/// Look up per-1K rates for a model name. Matches on the model portion
/// (after any provider/ prefix) so "anthropic/claude-3-5-sonnet" and
/// "claude-3-5-sonnet" both match.
pub fn lookup(model_name: &str) -> ModelPricing {
    let model = model_name
        .split_once('/')
        .map(|(_, m)| m)
        .unwrap_or(model_name);

    let rates = |input: f64, output: f64| ModelPricing {
        input_per_1k: input,
        output_per_1k: output,
    };

    match model {
        m if m.starts_with("claude-3-opus") => rates(0.015, 0.075),
        m if m.starts_with("claude-3-5-sonnet") => rates(0.003, 0.015),
        m if m.starts_with("claude-3-sonnet") => rates(0.003, 0.015),
        m if m.starts_with("claude-3-5-haiku") => rates(0.0008, 0.004),
        m if m.starts_with("claude-3-haiku") => rates(0.00025, 0.00125),

        m if m.starts_with("gpt-4o-mini") => rates(0.00015, 0.0006),
        m if m.starts_with("gpt-4o") => rates(0.0025, 0.01),
        m if m.starts_with("gpt-4-turbo") => rates(0.01, 0.03),
        m if m.starts_with("gpt-4") => rates(0.03, 0.06),
        m if m.starts_with("gpt-3.5-turbo") => rates(0.0005, 0.0015),

        m if m.starts_with("gemini-1.5-pro") => rates(0.00125, 0.005),
        m if m.starts_with("gemini-1.5-flash") => rates(0.000075, 0.0003),
        m if m.starts_with("gemini-2.0-flash") => rates(0.000075, 0.0003),

        // Local inference is free.
        m if m.starts_with("llama") || m.starts_with("mistral") || m.starts_with("phi") => {
            rates(0.0, 0.0)
        }

        _ => rates(0.003, 0.015),
    }
}

/// Estimate cost in USD for a chat call: input and output tokens priced at
/// their own per-1K rates and summed.
pub fn estimate_chat_cost(model_name: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    lookup(model_name).cost(&TokenUsage::new(prompt_tokens, completion_tokens))
}
