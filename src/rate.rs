//! Per-provider pacing: in-flight caps and minimum dispatch spacing.
//!
//! Each provider gets one semaphore sized by its tier's `max_in_flight` and
//! one spacing gate that serializes dispatch instants. Both are shared
//! process-wide across every worker, which makes the governor the single
//! point preventing one worker from monopolizing a provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{ProviderConfig, RateConfig, Tier};
use crate::error::ProviderError;

struct ProviderGate {
    tier: Tier,
    semaphore: Arc<Semaphore>,
    min_spacing: Duration,
    /// Last dispatch instant; locked only around the spacing computation.
    last_dispatch: Arc<tokio::sync::Mutex<Option<Instant>>>,
}

/// Holds one in-flight slot for a provider; dropping it releases the slot.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Process-wide rate governor, one gate per provider.
pub struct RateGovernor {
    gates: HashMap<String, ProviderGate>,
}

impl RateGovernor {
    pub fn from_config(providers: &[ProviderConfig], rate: &RateConfig) -> Self {
        let gates = providers
            .iter()
            .map(|p| {
                let limits = rate.limits(p.tier);
                (
                    p.name.clone(),
                    ProviderGate {
                        tier: p.tier,
                        semaphore: Arc::new(Semaphore::new(limits.max_in_flight)),
                        min_spacing: limits.min_spacing,
                        last_dispatch: Arc::new(tokio::sync::Mutex::new(None)),
                    },
                )
            })
            .collect();
        Self { gates }
    }

    /// Acquire a dispatch slot for a provider: wait for an in-flight slot,
    /// then honor the tier's minimum spacing since the previous dispatch.
    pub async fn acquire(&self, provider: &str) -> Result<RatePermit, ProviderError> {
        let Some(gate) = self.gates.get(provider) else {
            return Err(ProviderError::Disabled {
                provider: provider.to_string(),
            });
        };

        let permit = gate
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Disabled {
                provider: provider.to_string(),
            })?;

        if !gate.min_spacing.is_zero() {
            let gate_lock = gate.last_dispatch.clone();
            let mut last = gate_lock.lock().await;
            if let Some(prev) = *last {
                let earliest = prev + gate.min_spacing;
                if let Some(wait) = earliest.checked_duration_since(Instant::now())
                    && !wait.is_zero()
                {
                    tokio::time::sleep(wait).await;
                }
            }
            *last = Some(Instant::now());
        }

        Ok(RatePermit { _permit: permit })
    }

    /// Tier of a registered provider.
    pub fn tier_of(&self, provider: &str) -> Option<Tier> {
        self.gates.get(provider).map(|g| g.tier)
    }

    /// Currently free in-flight slots, for diagnostics.
    pub fn available_slots(&self, provider: &str) -> Option<usize> {
        self.gates.get(provider).map(|g| g.semaphore.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TierLimits, WireKind};
    use secrecy::SecretString;

    fn provider(name: &str, tier: Tier) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: WireKind::Openai,
            tier,
            models: vec!["m".to_string()],
            base_url: "https://api.example.com".to_string(),
            keys: vec![SecretString::from("k")],
        }
    }

    fn rate(max_in_flight: usize, min_spacing: Duration) -> RateConfig {
        let limits = TierLimits {
            max_in_flight,
            min_spacing,
        };
        RateConfig {
            fast: limits,
            medium: limits,
            slow: limits,
        }
    }

    #[tokio::test]
    async fn test_in_flight_cap_blocks() {
        let governor = RateGovernor::from_config(
            &[provider("openai", Tier::Fast)],
            &rate(2, Duration::ZERO),
        );

        let p1 = governor.acquire("openai").await.unwrap();
        let _p2 = governor.acquire("openai").await.unwrap();
        assert_eq!(governor.available_slots("openai"), Some(0));

        // Third acquire blocks until a permit is dropped.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), governor.acquire("openai")).await;
        assert!(blocked.is_err(), "third acquire should block at cap 2");

        drop(p1);
        let unblocked =
            tokio::time::timeout(Duration::from_millis(200), governor.acquire("openai")).await;
        assert!(unblocked.is_ok());
    }

    #[tokio::test]
    async fn test_min_spacing_separates_dispatches() {
        let governor = RateGovernor::from_config(
            &[provider("slowpoke", Tier::Slow)],
            &rate(4, Duration::from_millis(50)),
        );

        let started = Instant::now();
        for _ in 0..3 {
            let _permit = governor.acquire("slowpoke").await.unwrap();
        }
        // Dispatches 2 and 3 each wait out the spacing.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let governor = RateGovernor::from_config(&[], &rate(1, Duration::ZERO));
        assert!(matches!(
            governor.acquire("ghost").await,
            Err(ProviderError::Disabled { .. })
        ));
    }

    #[tokio::test]
    async fn test_permits_shared_across_tasks() {
        let governor = Arc::new(RateGovernor::from_config(
            &[provider("openai", Tier::Fast)],
            &rate(1, Duration::ZERO),
        ));

        // Hold the only permit in one task; a second task must wait.
        let permit = governor.acquire("openai").await.unwrap();
        let g2 = Arc::clone(&governor);
        let waiter = tokio::spawn(async move { g2.acquire("openai").await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter
            .await
            .expect("join")
            .expect("second acquire succeeds after release");
    }
}
