//! Persistence layer.
//!
//! A backend-agnostic [`Database`] trait covers both halves of the engine's
//! state: the `domains` work queue and the append-only `domain_responses`
//! store. Two implementations exist:
//!
//! - `postgres` (default feature): `deadpool-postgres` + `tokio-postgres`,
//!   row-level locking with skip-locked claims.
//! - `memory`: in-process backend used by the test harness and for
//!   credential-free local runs.
//!
//! Queue state transitions happen only through these methods; no other code
//! mutates domain status.

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::domain::{Domain, DomainStatus, ResponseOutcome, ResponseRow};
use crate::error::DatabaseError;

/// One satisfied grid cell of a domain: some row exists for this
/// (prompt, model) within the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellOutcome {
    pub prompt_id: String,
    pub model: String,
    pub outcome: ResponseOutcome,
}

/// Per-model outcome counts over a rolling window, for the quality audit.
#[derive(Debug, Clone)]
pub struct ModelStats {
    pub model: String,
    pub total: i64,
    pub permanent_errors: i64,
}

impl ModelStats {
    /// Fraction of rows in the window that are permanent errors.
    pub fn permanent_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.permanent_errors as f64 / self.total as f64
        }
    }
}

/// Create a database backend from configuration, run migrations, and
/// return it.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "postgres")]
        crate::config::DatabaseBackend::Postgres => {
            let pg = postgres::PgBackend::new(config)
                .await
                .map_err(|e| DatabaseError::Pool(e.to_string()))?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[cfg(not(feature = "postgres"))]
        crate::config::DatabaseBackend::Postgres => Err(DatabaseError::Pool(
            "postgres backend not compiled in; enable the 'postgres' feature".to_string(),
        )),
        crate::config::DatabaseBackend::Memory => {
            let backend = memory::MemoryBackend::new();
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Backend-agnostic persistence trait: the work queue plus the response
/// store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ==================== Queue ====================

    /// Insert a pending domain. Returns the new id, or `None` when the
    /// case-folded host already exists.
    async fn insert_domain(
        &self,
        host: &str,
        source: Option<&str>,
    ) -> Result<Option<Uuid>, DatabaseError>;

    /// Fetch one domain by id.
    async fn get_domain(&self, id: Uuid) -> Result<Option<Domain>, DatabaseError>;

    /// Atomically claim up to `batch_size` domains for `worker_id`,
    /// incrementing each one's `attempt_count` (the counter tracks
    /// processing rounds, not failures).
    ///
    /// Eligible: `pending` outside its retry backoff, or `processing` with
    /// an expired claim deadline. Oldest `last_processed_at` first, ties by
    /// id. Concurrent claimants never receive overlapping sets.
    async fn claim_domains(
        &self,
        worker_id: &str,
        batch_size: i64,
        claim_ttl: Duration,
    ) -> Result<Vec<Domain>, DatabaseError>;

    /// Revert a claim to pending, iff still held by `worker_id`.
    async fn release_domain(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError>;

    /// Mark a domain completed and clear its claim, iff held by `worker_id`.
    async fn complete_domain(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError>;

    /// Record a failed processing round. While `attempt_count` is below
    /// `max_attempts` the domain returns to pending with
    /// `next_attempt_at = now + backoff`; at the cap it goes terminal.
    /// Returns the resulting status.
    async fn fail_domain(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        max_attempts: i32,
        backoff: Duration,
    ) -> Result<DomainStatus, DatabaseError>;

    /// Return all `processing` domains with expired claims to pending.
    /// Guardian-only (plus its direct CLI wrapper).
    async fn reset_stuck(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Force a domain (any status) back to pending with cleared counters.
    /// Returns false when the id is unknown.
    async fn reopen_domain(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Number of domains currently claimable as pending.
    async fn pending_count(&self) -> Result<i64, DatabaseError>;

    // ==================== Response store ====================

    /// Insert-if-absent on the deterministic row id. Returns true when the
    /// row was written, false when a row with the same id already existed
    /// (the duplicate is silently dropped).
    async fn insert_response(&self, row: &ResponseRow) -> Result<bool, DatabaseError>;

    /// Cells of this domain satisfied within the window: any row, `ok` or
    /// `permanent_error`, per (prompt, model). `ok` dominates when both
    /// exist.
    async fn satisfied_cells(
        &self,
        domain_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<CellOutcome>, DatabaseError>;

    /// Domains completed within the window, for guardian cell repair.
    async fn completed_domains_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Domain>, DatabaseError>;

    /// Per-model outcome counts since `since`, for the quality audit.
    async fn provider_error_rates(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ModelStats>, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_rate() {
        let stats = ModelStats {
            model: "gpt-4o".to_string(),
            total: 10,
            permanent_errors: 4,
        };
        assert!((stats.permanent_rate() - 0.4).abs() < f64::EPSILON);

        let empty = ModelStats {
            model: "gpt-4o".to_string(),
            total: 0,
            permanent_errors: 0,
        };
        assert_eq!(empty.permanent_rate(), 0.0);
    }
}
