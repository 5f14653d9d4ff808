//! Provider roster: which LLM providers participate in the crawl, with
//! which models, at which pacing tier, under which credentials.
//!
//! The roster itself lives in a TOML file (`PROVIDERS_FILE`, default
//! `providers.toml`); credentials are resolved from the environment through
//! each entry's `credentials_ref` and are never read anywhere else.

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Pacing class for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Many parallel calls, no spacing.
    Fast,
    /// Modest parallelism, ~1 s spacing.
    Medium,
    /// Low parallelism, several seconds of spacing.
    Slow,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Medium => write!(f, "medium"),
            Self::Slow => write!(f, "slow"),
        }
    }
}

/// Wire protocol family an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    /// OpenAI Chat Completions (`/v1/chat/completions`, Bearer auth).
    Openai,
    /// Anthropic Messages (`/v1/messages`, x-api-key auth).
    Anthropic,
}

/// One provider entry from the roster file, pre-credential-resolution.
#[derive(Debug, Deserialize)]
struct RawProvider {
    name: String,
    #[serde(default)]
    kind: Option<WireKind>,
    tier: Tier,
    models: Vec<String>,
    base_url: String,
    credentials_ref: String,
}

#[derive(Debug, Deserialize)]
struct RawRoster {
    #[serde(default)]
    providers: Vec<RawProvider>,
}

/// A fully resolved provider: roster entry plus its credentials.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Logical family name, unique within the roster ("openai", "anthropic",
    /// "together", ...).
    pub name: String,
    /// Which wire protocol the adapter speaks.
    pub kind: WireKind,
    pub tier: Tier,
    /// Concrete model identifiers fanned out per domain.
    pub models: Vec<String>,
    pub base_url: String,
    /// Ordered credential set; index positions are stable for the run and
    /// recorded on every response row as `key_index`.
    pub keys: Vec<SecretString>,
}

/// Load the roster file and resolve credentials from the environment.
///
/// Credential discovery: for `credentials_ref = "OPENAI_API_KEY"` the pool
/// is `OPENAI_API_KEY`, `OPENAI_API_KEY_2`, ... up to the first gap.
pub(crate) fn resolve_providers() -> Result<Vec<ProviderConfig>, ConfigError> {
    let path = parse_optional_env("PROVIDERS_FILE", "providers.toml".to_string())?;
    let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileUnreadable {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let roster: RawRoster = toml::from_str(&raw).map_err(|e| ConfigError::FileInvalid {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    let mut providers = Vec::with_capacity(roster.providers.len());
    for entry in roster.providers {
        providers.push(resolve_entry(entry)?);
    }
    validate_roster(&providers)?;
    Ok(providers)
}

fn resolve_entry(entry: RawProvider) -> Result<ProviderConfig, ConfigError> {
    Url::parse(&entry.base_url).map_err(|e| ConfigError::InvalidValue {
        key: format!("providers.{}.base_url", entry.name),
        message: e.to_string(),
    })?;

    let kind = entry.kind.unwrap_or(match entry.name.as_str() {
        "anthropic" => WireKind::Anthropic,
        _ => WireKind::Openai,
    });

    let keys = discover_keys(&entry.credentials_ref)?;
    if keys.is_empty() {
        return Err(ConfigError::MissingRequired {
            key: entry.credentials_ref.clone(),
            hint: format!(
                "Provider '{}' needs at least one credential in the environment",
                entry.name
            ),
        });
    }

    Ok(ProviderConfig {
        name: entry.name,
        kind,
        tier: entry.tier,
        models: entry.models,
        base_url: entry.base_url,
        keys,
    })
}

fn discover_keys(credentials_ref: &str) -> Result<Vec<SecretString>, ConfigError> {
    let mut keys = Vec::new();
    if let Some(primary) = optional_env(credentials_ref)? {
        keys.push(SecretString::from(primary));
    }
    for n in 2.. {
        match optional_env(&format!("{credentials_ref}_{n}"))? {
            Some(extra) => keys.push(SecretString::from(extra)),
            None => break,
        }
    }
    Ok(keys)
}

fn validate_roster(providers: &[ProviderConfig]) -> Result<(), ConfigError> {
    if providers.is_empty() {
        return Err(ConfigError::MissingRequired {
            key: "providers".to_string(),
            hint: "The roster file declares no providers".to_string(),
        });
    }
    let mut seen = std::collections::HashSet::new();
    for p in providers {
        if !seen.insert(p.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "providers".to_string(),
                message: format!("duplicate provider name '{}'", p.name),
            });
        }
        if p.models.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: format!("providers.{}.models", p.name),
                message: "at least one model is required".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, base_url: &str, credentials_ref: &str) -> RawProvider {
        RawProvider {
            name: name.to_string(),
            kind: None,
            tier: Tier::Fast,
            models: vec!["m1".to_string()],
            base_url: base_url.to_string(),
            credentials_ref: credentials_ref.to_string(),
        }
    }

    #[test]
    fn test_roster_toml_shape() {
        let raw = r#"
            [[providers]]
            name = "openai"
            tier = "fast"
            models = ["gpt-4o-mini"]
            base_url = "https://api.openai.com"
            credentials_ref = "OPENAI_API_KEY"

            [[providers]]
            name = "anthropic"
            kind = "anthropic"
            tier = "medium"
            models = ["claude-sonnet-4-5"]
            base_url = "https://api.anthropic.com"
            credentials_ref = "ANTHROPIC_API_KEY"
        "#;
        let roster: RawRoster = toml::from_str(raw).expect("parse");
        assert_eq!(roster.providers.len(), 2);
        assert_eq!(roster.providers[1].kind, Some(WireKind::Anthropic));
        assert_eq!(roster.providers[0].tier, Tier::Fast);
    }

    #[test]
    fn test_kind_defaults_by_name() {
        unsafe { std::env::set_var("PG_TEST_ANTH_KEY", "sk-test") };
        let resolved =
            resolve_entry(entry("anthropic", "https://api.anthropic.com", "PG_TEST_ANTH_KEY"))
                .expect("resolve");
        assert_eq!(resolved.kind, WireKind::Anthropic);

        unsafe { std::env::set_var("PG_TEST_OTHER_KEY", "sk-test") };
        let resolved = resolve_entry(entry(
            "together",
            "https://api.together.xyz",
            "PG_TEST_OTHER_KEY",
        ))
        .expect("resolve");
        assert_eq!(resolved.kind, WireKind::Openai);
    }

    #[test]
    fn test_key_discovery_stops_at_gap() {
        unsafe {
            std::env::set_var("PG_TEST_POOL_KEY", "k1");
            std::env::set_var("PG_TEST_POOL_KEY_2", "k2");
            std::env::set_var("PG_TEST_POOL_KEY_4", "k4");
        }
        let keys = discover_keys("PG_TEST_POOL_KEY").expect("discover");
        // _4 is unreachable past the _3 gap.
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = resolve_entry(entry("openai", "https://api.openai.com", "PG_TEST_NO_KEY"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        unsafe { std::env::set_var("PG_TEST_URL_KEY", "k") };
        let err = resolve_entry(entry("openai", "not a url", "PG_TEST_URL_KEY")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        unsafe { std::env::set_var("PG_TEST_DUP_KEY", "k") };
        let a = resolve_entry(entry("openai", "https://api.openai.com", "PG_TEST_DUP_KEY"))
            .expect("resolve");
        let b = a.clone();
        let err = validate_roster(&[a, b]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
