//! Provider adapters.
//!
//! An adapter converts `(prompt, model, key)` into one provider HTTP call
//! and returns parsed content or a typed [`ProviderError`]. Adapters are
//! pure: no retries, no sleeps, no shared mutable state. Pacing belongs to
//! the rate governor and retry policy to the worker.

pub mod anthropic;
pub mod openai;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::{ProviderConfig, Tier, WireKind};
use crate::error::ProviderError;

/// Upper bound on any provider response body.
pub(crate) const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Token budget requested per completion.
pub(crate) const MAX_COMPLETION_TOKENS: u32 = 1024;

/// A successful, validated provider response.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// Non-empty content; adapters never return an empty success.
    pub content: String,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub latency: Duration,
}

/// One provider HTTP client.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Logical provider family this adapter serves.
    fn provider_name(&self) -> &str;

    /// Issue one completion call. The key is handed out by the key pool;
    /// `key_index` only labels errors so the pool can attribute them.
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        key: &SecretString,
        key_index: usize,
    ) -> Result<ProviderReply, ProviderError>;
}

/// A provider with its adapter, roster entry, and tier.
pub struct RegisteredProvider {
    pub config: ProviderConfig,
    pub adapter: Arc<dyn ProviderAdapter>,
}

/// All enabled providers, ordered fast tier first so the slowest provider
/// dominates wall time instead of queueing behind faster ones.
pub struct AdapterSet {
    providers: Vec<RegisteredProvider>,
}

impl AdapterSet {
    /// Build adapters for the whole roster over one shared HTTP client.
    pub fn from_config(
        providers: &[ProviderConfig],
        call_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| ProviderError::Transient {
                provider: "startup".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let mut registered: Vec<RegisteredProvider> = providers
            .iter()
            .map(|cfg| {
                let adapter: Arc<dyn ProviderAdapter> = match cfg.kind {
                    WireKind::Openai => Arc::new(openai::OpenAiAdapter::new(
                        client.clone(),
                        cfg.name.clone(),
                        cfg.base_url.clone(),
                    )),
                    WireKind::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(
                        client.clone(),
                        cfg.name.clone(),
                        cfg.base_url.clone(),
                    )),
                };
                RegisteredProvider {
                    config: cfg.clone(),
                    adapter,
                }
            })
            .collect();
        registered.sort_by(|a, b| {
            (a.config.tier, &a.config.name).cmp(&(b.config.tier, &b.config.name))
        });

        Ok(Self {
            providers: registered,
        })
    }

    /// Build from pre-constructed adapters (test harness entry point).
    pub fn from_adapters(mut providers: Vec<RegisteredProvider>) -> Self {
        providers.sort_by(|a, b| {
            (a.config.tier, &a.config.name).cmp(&(b.config.tier, &b.config.name))
        });
        Self { providers }
    }

    /// Providers in dispatch order (fast tier first).
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.iter()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.providers.iter().find(|p| p.config.name == name)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Tier of a provider, for governor lookups.
    pub fn tier_of(&self, name: &str) -> Option<Tier> {
        self.get(name).map(|p| p.config.tier)
    }
}

/// Map an HTTP error status to the fixed taxonomy.
///
/// 401/403 are attributed to the key; 408/429/5xx are transient (429 with
/// its own variant so the key pool can cool the key); every other 4xx is
/// permanent.
pub(crate) fn classify_status(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
    key_index: usize,
) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthFailed {
            provider: provider.to_string(),
            key_index,
        },
        429 => ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if retry::is_retryable_status(s) => ProviderError::Transient {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {}", truncate(body, 200)),
        },
        _ => ProviderError::Permanent {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {}", truncate(body, 200)),
        },
    }
}

/// Map a transport error to the taxonomy. Timeouts are surfaced as such so
/// logs distinguish slow providers from broken ones.
pub(crate) fn classify_transport(
    provider: &str,
    err: &reqwest::Error,
    elapsed: Duration,
) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            elapsed,
        }
    } else {
        ProviderError::Transient {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    }
}

/// The hard contract on success bodies: HTTP 200 with absent or empty
/// content is malformed, never success.
pub(crate) fn require_content(provider: &str, content: String) -> Result<String, ProviderError> {
    if content.trim().is_empty() {
        Err(ProviderError::Malformed {
            provider: provider.to_string(),
            reason: "200 response with empty content".to_string(),
        })
    } else {
        Ok(content)
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_classify_status_taxonomy() {
        assert!(matches!(
            classify_status("openai", 401, "", None, 2),
            ProviderError::AuthFailed { key_index: 2, .. }
        ));
        assert!(matches!(
            classify_status("openai", 429, "", None, 0),
            ProviderError::RateLimited { .. }
        ));
        assert_eq!(
            classify_status("openai", 503, "overloaded", None, 0).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_status("openai", 408, "", None, 0).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_status("openai", 400, "bad request", None, 0).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_status("openai", 404, "no such model", None, 0).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_empty_content_is_malformed() {
        assert!(matches!(
            require_content("openai", "   ".to_string()),
            Err(ProviderError::Malformed { .. })
        ));
        assert_eq!(
            require_content("openai", "real content".to_string()).unwrap(),
            "real content"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("short", 200), "short");
    }
}
