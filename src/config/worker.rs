use std::time::Duration;

use crate::config::helpers::{duration_ms_env, duration_secs_env, parse_optional_env};
use crate::error::ConfigError;

/// Domain worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How many workers the supervisor spawns.
    pub count: usize,
    /// Domains claimed per batch.
    pub batch_size: usize,
    /// Overall deadline for one domain's fan-out.
    pub domain_deadline: Duration,
    /// Claim attempts before a domain goes terminal.
    pub max_attempts: i32,
    /// How long in-flight calls may drain on shutdown.
    pub grace: Duration,
    /// Per-call HTTP timeout.
    pub call_timeout: Duration,
    /// Sleep between claim attempts when the queue is empty.
    pub idle_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            batch_size: 5,
            domain_deadline: Duration::from_secs(300),
            max_attempts: 3,
            grace: Duration::from_secs(10),
            call_timeout: Duration::from_secs(45),
            idle_delay: Duration::from_secs(15),
        }
    }
}

impl WorkerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            count: parse_optional_env("WORKER_COUNT", d.count)?,
            batch_size: parse_optional_env("WORKER_BATCH_SIZE", d.batch_size)?,
            domain_deadline: duration_secs_env("WORKER_DOMAIN_DEADLINE_SECS", d.domain_deadline)?,
            max_attempts: parse_optional_env("WORKER_MAX_ATTEMPTS", d.max_attempts)?,
            grace: duration_secs_env("WORKER_GRACE_SECS", d.grace)?,
            call_timeout: duration_secs_env("WORKER_CALL_TIMEOUT_SECS", d.call_timeout)?,
            idle_delay: duration_secs_env("WORKER_IDLE_DELAY_SECS", d.idle_delay)?,
        })
    }
}

/// Per-cell retry policy: exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Maximum adapter calls per cell within a window.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 4,
        }
    }
}

impl RetryConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            base: duration_ms_env("RETRY_BASE_MS", d.base)?,
            cap: duration_ms_env("RETRY_CAP_MS", d.cap)?,
            max_attempts: parse_optional_env("RETRY_MAX_ATTEMPTS", d.max_attempts)?,
        })
    }
}

/// Completion policy: how much of the grid must be `ok` and how far back
/// the window reaches.
#[derive(Debug, Clone)]
pub struct CoverageConfig {
    /// Fraction of (prompt × model) cells that must carry an `ok` row for a
    /// domain to complete. 1.0 means the full grid.
    pub required_fraction: f64,
    /// The crawl window over which coverage is evaluated.
    pub window: Duration,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            required_fraction: 1.0,
            window: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl CoverageConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();
        let required_fraction =
            parse_optional_env("COVERAGE_REQUIRED_FRACTION", d.required_fraction)?;
        if !(0.0..=1.0).contains(&required_fraction) {
            return Err(ConfigError::InvalidValue {
                key: "COVERAGE_REQUIRED_FRACTION".to_string(),
                message: format!("{required_fraction} is outside [0, 1]"),
            });
        }
        let window_days: u64 = parse_optional_env("COVERAGE_WINDOW_DAYS", 7)?;
        Ok(Self {
            required_fraction,
            window: Duration::from_secs(window_days * 24 * 3600),
        })
    }

    /// How many `ok` cells a grid of `total` cells needs to complete.
    ///
    /// Exactly the threshold completes; one fewer does not.
    pub fn required_cells(&self, total: usize) -> usize {
        (self.required_fraction * total as f64).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_cells_boundary() {
        let full = CoverageConfig {
            required_fraction: 1.0,
            ..CoverageConfig::default()
        };
        assert_eq!(full.required_cells(8), 8);

        // The historical six-of-eight policy.
        let partial = CoverageConfig {
            required_fraction: 0.75,
            ..CoverageConfig::default()
        };
        assert_eq!(partial.required_cells(8), 6);
        assert_eq!(partial.required_cells(7), 6);
    }

    #[test]
    fn test_zero_fraction_requires_nothing() {
        let cfg = CoverageConfig {
            required_fraction: 0.0,
            ..CoverageConfig::default()
        };
        assert_eq!(cfg.required_cells(8), 0);
    }

    #[test]
    fn test_fraction_out_of_range_rejected() {
        unsafe { std::env::set_var("COVERAGE_REQUIRED_FRACTION", "1.5") };
        let err = CoverageConfig::resolve().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        unsafe { std::env::remove_var("COVERAGE_REQUIRED_FRACTION") };
    }

    #[test]
    fn test_worker_defaults() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.count, 4);
        assert_eq!(cfg.max_attempts, 3);
        assert!(cfg.domain_deadline > cfg.call_timeout);
    }
}
