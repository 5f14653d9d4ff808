//! Configuration: a single immutable [`Config`] value built at startup.
//!
//! Every environment read in the crate happens here. Components receive the
//! sub-view they need (`&WorkerConfig`, `&RateConfig`, ...) from the
//! supervisor; nothing reads `std::env` at call sites.

mod database;
mod guardian;
pub(crate) mod helpers;
mod prompts;
mod providers;
mod rate;
mod worker;

pub use database::{DatabaseBackend, DatabaseConfig};
pub use guardian::GuardianConfig;
pub use prompts::Prompt;
pub use providers::{ProviderConfig, Tier, WireKind};
pub use rate::{RateConfig, TierLimits};
pub use worker::{CoverageConfig, RetryConfig, WorkerConfig};

use crate::error::ConfigError;

/// The assembled configuration for one crawl process.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub providers: Vec<ProviderConfig>,
    pub prompts: Vec<Prompt>,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub coverage: CoverageConfig,
    pub rate: RateConfig,
    pub guardian: GuardianConfig,
}

impl Config {
    /// Resolve the full configuration from the environment and the roster
    /// and prompt files. `.env` loading (dotenvy) happens in `main` before
    /// this is called.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            providers: providers::resolve_providers()?,
            prompts: prompts::resolve_prompts()?,
            worker: WorkerConfig::resolve()?,
            retry: RetryConfig::resolve()?,
            coverage: CoverageConfig::resolve()?,
            rate: RateConfig::resolve()?,
            guardian: GuardianConfig::resolve()?,
        })
    }

    /// Total grid size per domain: |prompts| × |models| over all providers.
    pub fn grid_size(&self) -> usize {
        let models: usize = self.providers.iter().map(|p| p.models.len()).sum();
        self.prompts.len() * models
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn test_grid_size() {
        let config = Config {
            database: DatabaseConfig {
                backend: DatabaseBackend::Memory,
                url: SecretString::from("unused://memory"),
                pool_size: 1,
            },
            providers: vec![
                ProviderConfig {
                    name: "openai".to_string(),
                    kind: WireKind::Openai,
                    tier: Tier::Fast,
                    models: vec!["a".to_string(), "b".to_string()],
                    base_url: "https://api.openai.com".to_string(),
                    keys: vec![SecretString::from("k")],
                },
                ProviderConfig {
                    name: "anthropic".to_string(),
                    kind: WireKind::Anthropic,
                    tier: Tier::Medium,
                    models: vec!["c".to_string()],
                    base_url: "https://api.anthropic.com".to_string(),
                    keys: vec![SecretString::from("k")],
                },
            ],
            prompts: vec![
                Prompt {
                    id: "p1".to_string(),
                    text: "t".to_string(),
                    version: 1,
                },
                Prompt {
                    id: "p2".to_string(),
                    text: "t".to_string(),
                    version: 1,
                },
            ],
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            coverage: CoverageConfig::default(),
            rate: RateConfig::default(),
            guardian: GuardianConfig::default(),
        };
        assert_eq!(config.grid_size(), 6);
    }
}
