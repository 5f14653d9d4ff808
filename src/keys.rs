//! Per-provider rotating credential pool.
//!
//! Keys are discovered once at startup from configuration and handed out
//! round-robin. A 429 cools the key briefly; a 401/403 quarantines it for
//! much longer. A provider with zero usable keys is disabled until one
//! recovers, and its checkouts fail with [`ProviderError::Disabled`].
//!
//! The pool is process-wide behind a std mutex; handouts are O(1) and the
//! lock is never held across I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use secrecy::SecretString;

use crate::config::ProviderConfig;
use crate::error::ProviderError;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
const DEFAULT_QUARANTINE: Duration = Duration::from_secs(900);

/// A checked-out credential. The index is stable for the run and recorded
/// on response rows.
#[derive(Clone)]
pub struct KeyLease {
    pub index: usize,
    pub secret: SecretString,
}

struct KeySlot {
    secret: SecretString,
    unavailable_until: Option<Instant>,
}

impl KeySlot {
    fn usable(&self, now: Instant) -> bool {
        self.unavailable_until.is_none_or(|t| t <= now)
    }
}

struct ProviderKeys {
    keys: Vec<KeySlot>,
    next: usize,
    disabled_until: Option<Instant>,
}

/// Process-wide credential pool, one rotation per provider.
pub struct KeyPool {
    providers: Mutex<HashMap<String, ProviderKeys>>,
    cooldown: Duration,
    quarantine: Duration,
}

impl KeyPool {
    pub fn from_config(providers: &[ProviderConfig]) -> Self {
        let map = providers
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    ProviderKeys {
                        keys: p
                            .keys
                            .iter()
                            .map(|k| KeySlot {
                                secret: k.clone(),
                                unavailable_until: None,
                            })
                            .collect(),
                        next: 0,
                        disabled_until: None,
                    },
                )
            })
            .collect();
        Self {
            providers: Mutex::new(map),
            cooldown: DEFAULT_COOLDOWN,
            quarantine: DEFAULT_QUARANTINE,
        }
    }

    /// Override penalty durations (tests use short ones).
    pub fn with_penalties(mut self, cooldown: Duration, quarantine: Duration) -> Self {
        self.cooldown = cooldown;
        self.quarantine = quarantine;
        self
    }

    /// Hand out the next usable key for a provider, round-robin.
    pub fn checkout(&self, provider: &str) -> Result<KeyLease, ProviderError> {
        let now = Instant::now();
        let mut pool = self.providers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = pool.get_mut(provider) else {
            return Err(ProviderError::Disabled {
                provider: provider.to_string(),
            });
        };
        if entry.disabled_until.is_some_and(|t| t > now) {
            return Err(ProviderError::Disabled {
                provider: provider.to_string(),
            });
        }

        let count = entry.keys.len();
        for offset in 0..count {
            let index = (entry.next + offset) % count;
            if entry.keys[index].usable(now) {
                entry.next = (index + 1) % count;
                return Ok(KeyLease {
                    index,
                    secret: entry.keys[index].secret.clone(),
                });
            }
        }
        Err(ProviderError::Disabled {
            provider: provider.to_string(),
        })
    }

    /// Cool a key after a 429. A server-provided `Retry-After` wins over
    /// the default cooldown.
    pub fn report_rate_limited(&self, provider: &str, index: usize, retry_after: Option<Duration>) {
        let penalty = retry_after.unwrap_or(self.cooldown);
        self.penalize(provider, index, penalty);
        tracing::debug!(provider, key_index = index, ?penalty, "key cooled after 429");
    }

    /// Quarantine a key after a 401/403.
    pub fn report_auth_failure(&self, provider: &str, index: usize) {
        self.penalize(provider, index, self.quarantine);
        tracing::warn!(
            provider,
            key_index = index,
            "key quarantined after auth failure"
        );
    }

    fn penalize(&self, provider: &str, index: usize, penalty: Duration) {
        let mut pool = self.providers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = pool.get_mut(provider)
            && let Some(slot) = entry.keys.get_mut(index)
        {
            slot.unavailable_until = Some(Instant::now() + penalty);
        }
    }

    /// Disable a whole provider for a fixed duration (guardian quality
    /// audit, opt-in).
    pub fn disable_provider(&self, provider: &str, until: Duration) {
        let mut pool = self.providers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = pool.get_mut(provider) {
            entry.disabled_until = Some(Instant::now() + until);
        }
    }

    /// Number of currently usable keys for a provider.
    pub fn active_keys(&self, provider: &str) -> usize {
        let now = Instant::now();
        let pool = self.providers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pool.get(provider)
            .map(|entry| entry.keys.iter().filter(|k| k.usable(now)).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Tier, WireKind};
    use secrecy::ExposeSecret;

    fn provider(name: &str, key_count: usize) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: WireKind::Openai,
            tier: Tier::Fast,
            models: vec!["m".to_string()],
            base_url: "https://api.example.com".to_string(),
            keys: (0..key_count)
                .map(|i| SecretString::from(format!("key-{i}")))
                .collect(),
        }
    }

    #[test]
    fn test_round_robin_rotation() {
        let pool = KeyPool::from_config(&[provider("openai", 3)]);
        let indices: Vec<usize> = (0..6)
            .map(|_| pool.checkout("openai").unwrap().index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_cooled_key_is_skipped() {
        let pool = KeyPool::from_config(&[provider("openai", 2)])
            .with_penalties(Duration::from_secs(60), Duration::from_secs(600));
        pool.report_rate_limited("openai", 0, None);

        for _ in 0..3 {
            assert_eq!(pool.checkout("openai").unwrap().index, 1);
        }
        assert_eq!(pool.active_keys("openai"), 1);
    }

    #[test]
    fn test_cooldown_expires() {
        let pool = KeyPool::from_config(&[provider("openai", 2)]);
        pool.report_rate_limited("openai", 0, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.active_keys("openai"), 2);
    }

    #[test]
    fn test_all_keys_quarantined_disables_provider() {
        let pool = KeyPool::from_config(&[provider("openai", 2)])
            .with_penalties(Duration::from_secs(60), Duration::from_secs(600));
        pool.report_auth_failure("openai", 0);
        pool.report_auth_failure("openai", 1);

        assert_eq!(pool.active_keys("openai"), 0);
        assert!(matches!(
            pool.checkout("openai"),
            Err(ProviderError::Disabled { .. })
        ));
    }

    #[test]
    fn test_explicit_disable() {
        let pool = KeyPool::from_config(&[provider("openai", 2)]);
        pool.disable_provider("openai", Duration::from_secs(60));
        assert!(matches!(
            pool.checkout("openai"),
            Err(ProviderError::Disabled { .. })
        ));
    }

    #[test]
    fn test_unknown_provider_is_disabled() {
        let pool = KeyPool::from_config(&[]);
        assert!(matches!(
            pool.checkout("nope"),
            Err(ProviderError::Disabled { .. })
        ));
    }

    #[test]
    fn test_lease_carries_secret() {
        let pool = KeyPool::from_config(&[provider("openai", 1)]);
        let lease = pool.checkout("openai").unwrap();
        assert_eq!(lease.secret.expose_secret(), "key-0");
    }
}
