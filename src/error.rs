//! Top-level error types for Switchboard.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
///
/// The four terminal kinds a caller can observe from a chat request map to
/// distinct variants: `Selection` (cannot route), `Budget` (spending limit),
/// `AllProvidersFailed` (every backend in the fallback chain failed), and
/// `Cancelled`. Individual provider failures are recoverable and drive the
/// fallback loop internally; only the final aggregate surfaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("all providers failed after {attempts} attempts: {last}")]
    AllProvidersFailed {
        attempts: usize,
        last: ProviderError,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Construction-time configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no providers registered")]
    NoProviders,

    #[error("duplicate provider name: {0}")]
    DuplicateProvider(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Routing errors. Terminal: the request cannot be served without
/// reconfiguration or a provider recovering.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("no healthy providers available")]
    NoHealthyProviders,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Budget ceiling violations. Terminal for the request, and deliberately
/// distinct from provider failure so callers can surface a spending-limit
/// message instead of a generic error.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error(
        "daily limit exceeded for {provider}: spent ${spent:.4} + estimated ${estimated:.4} > ${limit:.2}"
    )]
    DailyLimitExceeded {
        provider: String,
        spent: f64,
        estimated: f64,
        limit: f64,
    },

    #[error(
        "monthly budget exceeded for {provider}: spent ${spent:.4} + estimated ${estimated:.4} > ${limit:.2}"
    )]
    MonthlyBudgetExceeded {
        provider: String,
        spent: f64,
        estimated: f64,
        limit: f64,
    },
}

/// Errors from a provider's own chat, probe, or metadata calls.
/// Recoverable: the manager walks the fallback chain on these.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request timed out")]
    Timeout,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("token counting failed: {0}")]
    TokenCount(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
