//! PostgreSQL backend over `deadpool-postgres`.
//!
//! Claim operations are single statements built on `FOR UPDATE SKIP LOCKED`
//! so concurrent claimants never observe overlapping sets; the response
//! insert is `ON CONFLICT DO NOTHING` on the deterministic row id. No
//! transaction spans a network call.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{CellOutcome, Database, ModelStats};
use crate::domain::{Domain, DomainStatus, ResponseOutcome, ResponseRow, canonical_host};
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// PostgreSQL-backed queue and response store.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Build the connection pool. Does not touch the schema; call
    /// [`Database::run_migrations`] before first use.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pg_config: tokio_postgres::Config = config
            .url()
            .parse()
            .map_err(|e: tokio_postgres::Error| DatabaseError::Pool(e.to_string()))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        self.pool
            .get()
            .await
            .map_err(|e| DatabaseError::Pool(e.to_string()))
    }
}

fn domain_from_row(row: &tokio_postgres::Row) -> Result<Domain, DatabaseError> {
    let status: String = row.get("status");
    let status: DomainStatus = status.parse().map_err(DatabaseError::Serialization)?;
    Ok(Domain {
        id: row.get("id"),
        host: row.get("domain"),
        status,
        source: row.get("source"),
        attempt_count: row.get("attempt_count"),
        last_error: row.get("last_error"),
        claim_holder: row.get("claim_holder"),
        claim_deadline: row.get("claim_deadline"),
        next_attempt_at: row.get("next_attempt_at"),
        last_processed_at: row.get("last_processed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const DOMAIN_COLUMNS: &str = "id, domain, status, source, attempt_count, last_error, \
     claim_holder, claim_deadline, next_attempt_at, last_processed_at, created_at, updated_at";

fn chrono_ms(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

#[async_trait]
impl Database for PgBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut client = self.client().await?;
        embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn insert_domain(
        &self,
        host: &str,
        source: Option<&str>,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let client = self.client().await?;
        let id = Uuid::new_v4();
        let inserted = client
            .execute(
                "INSERT INTO domains (id, domain, status, source) VALUES ($1, $2, 'pending', $3) \
                 ON CONFLICT (domain) DO NOTHING",
                &[&id, &canonical_host(host), &source],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok((inserted == 1).then_some(id))
    }

    async fn get_domain(&self, id: Uuid) -> Result<Option<Domain>, DatabaseError> {
        let client = self.client().await?;
        let stmt = format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = $1");
        let rows = client
            .query(stmt.as_str(), &[&id])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        rows.first().map(domain_from_row).transpose()
    }

    async fn claim_domains(
        &self,
        worker_id: &str,
        batch_size: i64,
        claim_ttl: Duration,
    ) -> Result<Vec<Domain>, DatabaseError> {
        let client = self.client().await?;
        let deadline = Utc::now() + chrono_ms(claim_ttl);
        let stmt = format!(
            "UPDATE domains SET status = 'processing', claim_holder = $1, \
             claim_deadline = $2, attempt_count = attempt_count + 1, \
             updated_at = now() \
             WHERE id IN ( \
                 SELECT id FROM domains \
                 WHERE (status = 'pending' \
                        AND (next_attempt_at IS NULL OR next_attempt_at <= now())) \
                    OR (status = 'processing' AND claim_deadline < now()) \
                 ORDER BY last_processed_at ASC NULLS FIRST, id ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {DOMAIN_COLUMNS}"
        );
        let rows = client
            .query(stmt.as_str(), &[&worker_id, &deadline, &batch_size])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        rows.iter().map(domain_from_row).collect()
    }

    async fn release_domain(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE domains SET status = 'pending', claim_holder = NULL, \
                 claim_deadline = NULL, updated_at = now() \
                 WHERE id = $1 AND claim_holder = $2 AND status = 'processing'",
                &[&id, &worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        if updated == 0 {
            tracing::debug!(domain_id = %id, worker_id, "release found no live claim");
        }
        Ok(())
    }

    async fn complete_domain(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE domains SET status = 'completed', last_processed_at = now(), \
                 claim_holder = NULL, claim_deadline = NULL, last_error = NULL, \
                 updated_at = now() \
                 WHERE id = $1 AND claim_holder = $2 AND status = 'processing'",
                &[&id, &worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        if updated == 0 {
            tracing::warn!(domain_id = %id, worker_id, "complete found no live claim");
        }
        Ok(())
    }

    async fn fail_domain(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        max_attempts: i32,
        backoff: Duration,
    ) -> Result<DomainStatus, DatabaseError> {
        let client = self.client().await?;
        let next_attempt_at = Utc::now() + chrono_ms(backoff);
        let rows = client
            .query(
                "UPDATE domains SET \
                     status = CASE WHEN attempt_count >= $3 \
                                   THEN 'error' ELSE 'pending' END, \
                     next_attempt_at = CASE WHEN attempt_count >= $3 \
                                            THEN NULL ELSE $5 END, \
                     last_error = $4, \
                     last_processed_at = now(), \
                     claim_holder = NULL, claim_deadline = NULL, updated_at = now() \
                 WHERE id = $1 AND claim_holder = $2 AND status = 'processing' \
                 RETURNING status",
                &[&id, &worker_id, &max_attempts, &error, &next_attempt_at],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows.first() {
            Some(row) => {
                let status: String = row.get("status");
                status.parse().map_err(DatabaseError::Serialization)
            }
            None => {
                // Claim was lost to expiry in the meantime; the domain is
                // already someone else's problem.
                tracing::debug!(domain_id = %id, worker_id, "fail found no live claim");
                Ok(DomainStatus::Pending)
            }
        }
    }

    async fn reset_stuck(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE domains SET status = 'pending', claim_holder = NULL, \
                 claim_deadline = NULL, updated_at = now() \
                 WHERE status = 'processing' AND claim_deadline < $1",
                &[&now],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))
    }

    async fn reopen_domain(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE domains SET status = 'pending', attempt_count = 0, last_error = NULL, \
                 claim_holder = NULL, claim_deadline = NULL, next_attempt_at = NULL, \
                 updated_at = now() \
                 WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(updated == 1)
    }

    async fn pending_count(&self) -> Result<i64, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM domains WHERE status = 'pending' \
                 AND (next_attempt_at IS NULL OR next_attempt_at <= now())",
                &[],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(row.get(0))
    }

    async fn insert_response(&self, row: &ResponseRow) -> Result<bool, DatabaseError> {
        let client = self.client().await?;
        let inserted = client
            .execute(
                "INSERT INTO domain_responses \
                 (id, domain_id, prompt_id, model, response, outcome, tokens_in, tokens_out, \
                  latency_ms, key_index, attempt, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &row.id,
                    &row.domain_id,
                    &row.prompt_id,
                    &row.model,
                    &row.response,
                    &row.outcome.to_string(),
                    &row.tokens_in,
                    &row.tokens_out,
                    &row.latency_ms,
                    &row.key_index,
                    &row.attempt,
                    &row.created_at,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(inserted == 1)
    }

    async fn satisfied_cells(
        &self,
        domain_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<CellOutcome>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT DISTINCT prompt_id, model, outcome FROM domain_responses \
                 WHERE domain_id = $1 AND created_at >= $2",
                &[&domain_id, &since],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        // A cell can carry both outcomes across reruns; ok dominates.
        let mut by_cell: std::collections::HashMap<(String, String), ResponseOutcome> =
            std::collections::HashMap::new();
        for row in &rows {
            let prompt_id: String = row.get("prompt_id");
            let model: String = row.get("model");
            let outcome: String = row.get("outcome");
            let outcome: ResponseOutcome = outcome.parse().map_err(DatabaseError::Serialization)?;
            by_cell
                .entry((prompt_id, model))
                .and_modify(|existing| {
                    if outcome == ResponseOutcome::Ok {
                        *existing = ResponseOutcome::Ok;
                    }
                })
                .or_insert(outcome);
        }
        Ok(by_cell
            .into_iter()
            .map(|((prompt_id, model), outcome)| CellOutcome {
                prompt_id,
                model,
                outcome,
            })
            .collect())
    }

    async fn completed_domains_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Domain>, DatabaseError> {
        let client = self.client().await?;
        let stmt = format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains \
             WHERE status = 'completed' AND last_processed_at >= $1"
        );
        let rows = client
            .query(stmt.as_str(), &[&since])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        rows.iter().map(domain_from_row).collect()
    }

    async fn provider_error_rates(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ModelStats>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT model, count(*) AS total, \
                        count(*) FILTER (WHERE outcome = 'permanent_error') AS permanent_errors \
                 FROM domain_responses WHERE created_at >= $1 \
                 GROUP BY model ORDER BY model",
                &[&since],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| ModelStats {
                model: row.get("model"),
                total: row.get("total"),
                permanent_errors: row.get("permanent_errors"),
            })
            .collect())
    }
}
