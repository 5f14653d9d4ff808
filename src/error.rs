//! Error types for the crawl engine.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while resolving configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("Missing required configuration '{key}'. {hint}")]
    MissingRequired {
        /// Environment variable or file key.
        key: String,
        /// How to fix it.
        hint: String,
    },

    /// A setting is present but unusable.
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// Environment variable or file key.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// A configuration file could not be read.
    #[error("Failed to read configuration file '{path}': {reason}")]
    FileUnreadable {
        /// Path that was attempted.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// A configuration file could not be parsed.
    #[error("Failed to parse configuration file '{path}': {reason}")]
    FileInvalid {
        /// Path that was attempted.
        path: String,
        /// Parser message.
        reason: String,
    },
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection pool creation or checkout failed.
    #[error("Database pool error: {0}")]
    Pool(String),

    /// A statement failed.
    #[error("Database query error: {0}")]
    Query(String),

    /// Schema migration failed.
    #[error("Database migration error: {0}")]
    Migration(String),

    /// A row contained data the engine cannot decode.
    #[error("Database serialization error: {0}")]
    Serialization(String),
}

/// How the worker's retry loop should treat a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff, possibly on a different key.
    Transient,
    /// Record a `permanent_error` row; do not retry within the window.
    Permanent,
    /// Transient for the first two attempts, permanent after.
    Malformed,
}

/// Errors from a provider adapter call.
///
/// The taxonomy is fixed: the worker maps each variant to a retry decision
/// via [`ProviderError::class`] and never inspects transport details itself.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, 5xx, 408, or provider-specific overload.
    #[error("Transient provider failure from '{provider}': {reason}")]
    Transient {
        /// Provider name.
        provider: String,
        /// Underlying reason.
        reason: String,
    },

    /// 429 from the provider; the key that hit it should cool down.
    #[error("Rate limited by '{provider}'")]
    RateLimited {
        /// Provider name.
        provider: String,
        /// Server-suggested wait, when the response carried one.
        retry_after: Option<Duration>,
    },

    /// 401/403 attributable to the key; the key should be quarantined.
    #[error("Authentication failed for '{provider}' (key #{key_index})")]
    AuthFailed {
        /// Provider name.
        provider: String,
        /// Which key in the pool failed.
        key_index: usize,
    },

    /// Any other 4xx, or a body that violates the provider's contract.
    #[error("Permanent provider failure from '{provider}': {reason}")]
    Permanent {
        /// Provider name.
        provider: String,
        /// Underlying reason.
        reason: String,
    },

    /// Unparseable body, or HTTP 200 with absent/empty content.
    #[error("Malformed response from '{provider}': {reason}")]
    Malformed {
        /// Provider name.
        provider: String,
        /// Underlying reason.
        reason: String,
    },

    /// The per-call timeout elapsed.
    #[error("Call to '{provider}' timed out after {elapsed:?}")]
    Timeout {
        /// Provider name.
        provider: String,
        /// How long the call ran.
        elapsed: Duration,
    },

    /// The provider has no usable keys left this cycle.
    #[error("Provider '{provider}' is disabled (no active keys)")]
    Disabled {
        /// Provider name.
        provider: String,
    },
}

impl ProviderError {
    /// Which provider raised this error.
    pub fn provider(&self) -> &str {
        match self {
            Self::Transient { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::AuthFailed { provider, .. }
            | Self::Permanent { provider, .. }
            | Self::Malformed { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Disabled { provider } => provider,
        }
    }

    /// Retry classification for the worker.
    ///
    /// `AuthFailed`, `RateLimited`, `Timeout`, and `Disabled` are all
    /// transient from the cell's point of view: the next attempt may run on
    /// a different key or after the pool recovers.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. }
            | Self::RateLimited { .. }
            | Self::AuthFailed { .. }
            | Self::Timeout { .. }
            | Self::Disabled { .. } => ErrorClass::Transient,
            Self::Permanent { .. } => ErrorClass::Permanent,
            Self::Malformed { .. } => ErrorClass::Malformed,
        }
    }

    /// Whether the attempt should be retried, given how many attempts have
    /// already run. Malformed bodies are retried twice before being treated
    /// as permanent.
    pub fn retryable(&self, attempts_so_far: u32) -> bool {
        match self.class() {
            ErrorClass::Transient => true,
            ErrorClass::Permanent => false,
            ErrorClass::Malformed => attempts_so_far < 2,
        }
    }

    /// Short error kind tag stored in `permanent_error` rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthFailed { .. } => "auth_failed",
            Self::Permanent { .. } => "permanent",
            Self::Malformed { .. } => "malformed",
            Self::Timeout { .. } => "timeout",
            Self::Disabled { .. } => "disabled",
        }
    }
}
