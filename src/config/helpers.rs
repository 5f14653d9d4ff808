//! Shared helpers for resolving configuration from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an environment variable, treating empty values as absent.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid unicode".to_string(),
        }),
    }
}

/// Read a required environment variable.
pub(crate) fn require_env(key: &str, hint: &str) -> Result<String, ConfigError> {
    optional_env(key)?.ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}

/// Parse an optional environment variable, falling back to a default.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse an optional whole-seconds duration from the environment.
pub(crate) fn duration_secs_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_optional_env(
        key,
        default.as_secs(),
    )?))
}

/// Parse an optional milliseconds duration from the environment.
pub(crate) fn duration_ms_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_optional_env(
        key,
        default.as_millis() as u64,
    )?))
}
