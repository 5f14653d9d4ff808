use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_optional_env, require_env};
use crate::error::ConfigError;

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseBackend {
    /// PostgreSQL via deadpool-postgres (default).
    #[default]
    Postgres,
    /// In-process store, for tests and credential-free local runs. State
    /// does not survive a restart.
    Memory,
}

impl std::fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            _ => Err(format!(
                "invalid database backend '{}', expected 'postgres' or 'memory'",
                s
            )),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Which backend to use (default: Postgres).
    pub backend: DatabaseBackend,
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend: DatabaseBackend = if let Some(b) = optional_env("DATABASE_BACKEND")? {
            b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: e,
            })?
        } else {
            DatabaseBackend::default()
        };

        // The URL is only meaningful for the postgres backend.
        let url = match backend {
            DatabaseBackend::Postgres => require_env(
                "DATABASE_URL",
                "Set DATABASE_URL to a PostgreSQL connection string",
            )?,
            DatabaseBackend::Memory => {
                optional_env("DATABASE_URL")?.unwrap_or_else(|| "unused://memory".to_string())
            }
        };

        let pool_size = parse_optional_env("DATABASE_POOL_SIZE", 16)?;

        Ok(Self {
            backend,
            url: SecretString::from(url),
            pool_size,
        })
    }

    /// Get the database URL (exposes the secret).
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!(
            "pg".parse::<DatabaseBackend>().unwrap(),
            DatabaseBackend::Postgres
        );
        assert_eq!(
            "Memory".parse::<DatabaseBackend>().unwrap(),
            DatabaseBackend::Memory
        );
        assert!("mysql".parse::<DatabaseBackend>().is_err());
    }
}
