use std::time::Duration;

use crate::config::helpers::{duration_secs_env, parse_optional_env};
use crate::error::ConfigError;

/// Coverage guardian configuration.
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    /// Cadence of the maintenance loop.
    pub interval: Duration,
    /// Claim TTL: a `processing` domain whose claim deadline is older than
    /// now is considered stuck and reclaimed.
    pub stuck_after: Duration,
    /// Rolling window for the quality audit.
    pub audit_window: Duration,
    /// Permanent-error fraction above which a provider alert is raised.
    pub audit_threshold: f64,
    /// Minimum rows in the audit window before the rate is meaningful.
    pub audit_min_samples: u64,
    /// Also disable an alerting provider for the next cycle.
    pub disable_on_alert: bool,
    /// Consecutive loop failures before the guardian gives up.
    pub max_failures: u32,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            stuck_after: Duration::from_secs(600),
            audit_window: Duration::from_secs(3600),
            audit_threshold: 0.5,
            audit_min_samples: 20,
            disable_on_alert: false,
            max_failures: 5,
        }
    }
}

impl GuardianConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();
        let audit_threshold = parse_optional_env("GUARDIAN_AUDIT_THRESHOLD", d.audit_threshold)?;
        if !(0.0..=1.0).contains(&audit_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "GUARDIAN_AUDIT_THRESHOLD".to_string(),
                message: format!("{audit_threshold} is outside [0, 1]"),
            });
        }
        Ok(Self {
            interval: duration_secs_env("GUARDIAN_INTERVAL_SECS", d.interval)?,
            stuck_after: duration_secs_env("GUARDIAN_STUCK_AFTER_SECS", d.stuck_after)?,
            audit_window: duration_secs_env("GUARDIAN_AUDIT_WINDOW_SECS", d.audit_window)?,
            audit_threshold,
            audit_min_samples: parse_optional_env(
                "GUARDIAN_AUDIT_MIN_SAMPLES",
                d.audit_min_samples,
            )?,
            disable_on_alert: parse_optional_env("GUARDIAN_DISABLE_ON_ALERT", d.disable_on_alert)?,
            max_failures: parse_optional_env("GUARDIAN_MAX_FAILURES", d.max_failures)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GuardianConfig::default();
        assert!(cfg.stuck_after > cfg.interval);
        assert!(!cfg.disable_on_alert);
    }
}
