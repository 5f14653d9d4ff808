use std::time::Duration;

use crate::config::helpers::{duration_ms_env, parse_optional_env};
use crate::config::providers::Tier;
use crate::error::ConfigError;

/// Pacing limits for one tier.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    /// Concurrent in-flight calls, shared across all workers.
    pub max_in_flight: usize,
    /// Minimum time between consecutive dispatches.
    pub min_spacing: Duration,
}

/// Rate governor configuration, one limit set per tier.
///
/// Tier values are policy, not contract; the defaults match the intent of
/// fast ≈ unthrottled, medium ≈ 1 s spacing, slow ≈ several seconds.
#[derive(Debug, Clone)]
pub struct RateConfig {
    pub fast: TierLimits,
    pub medium: TierLimits,
    pub slow: TierLimits,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            fast: TierLimits {
                max_in_flight: 8,
                min_spacing: Duration::ZERO,
            },
            medium: TierLimits {
                max_in_flight: 4,
                min_spacing: Duration::from_secs(1),
            },
            slow: TierLimits {
                max_in_flight: 2,
                min_spacing: Duration::from_secs(6),
            },
        }
    }
}

impl RateConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            fast: resolve_tier("FAST", d.fast)?,
            medium: resolve_tier("MEDIUM", d.medium)?,
            slow: resolve_tier("SLOW", d.slow)?,
        })
    }

    /// Limits for a tier.
    pub fn limits(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Fast => self.fast,
            Tier::Medium => self.medium,
            Tier::Slow => self.slow,
        }
    }
}

fn resolve_tier(tier: &str, default: TierLimits) -> Result<TierLimits, ConfigError> {
    let max_in_flight = parse_optional_env(
        &format!("RATE_{tier}_MAX_IN_FLIGHT"),
        default.max_in_flight,
    )?;
    if max_in_flight == 0 {
        return Err(ConfigError::InvalidValue {
            key: format!("RATE_{tier}_MAX_IN_FLIGHT"),
            message: "must be at least 1".to_string(),
        });
    }
    let min_spacing = duration_ms_env(&format!("RATE_{tier}_MIN_SPACING_MS"), default.min_spacing)?;
    Ok(TierLimits {
        max_in_flight,
        min_spacing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_lookup() {
        let cfg = RateConfig::default();
        assert_eq!(cfg.limits(Tier::Fast).max_in_flight, 8);
        assert_eq!(cfg.limits(Tier::Slow).min_spacing, Duration::from_secs(6));
    }

    #[test]
    fn test_zero_in_flight_rejected() {
        unsafe { std::env::set_var("RATE_FAST_MAX_IN_FLIGHT", "0") };
        let err = RateConfig::resolve().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        unsafe { std::env::remove_var("RATE_FAST_MAX_IN_FLIGHT") };
    }
}
