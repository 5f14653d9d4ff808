//! In-process backend.
//!
//! Mirrors the PostgreSQL backend's semantics (claim eligibility, ordering,
//! holder guards, idempotent insert) over a single mutex. Used by the test
//! harness and for credential-free local runs; state does not survive a
//! restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{CellOutcome, Database, ModelStats};
use crate::domain::{Domain, DomainStatus, ResponseOutcome, ResponseRow, canonical_host};
use crate::error::DatabaseError;

#[derive(Default)]
struct Inner {
    domains: HashMap<Uuid, Domain>,
    responses: HashMap<Uuid, ResponseRow>,
}

/// Memory-backed queue and response store.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored response rows, for test assertions.
    pub async fn response_count(&self) -> usize {
        self.inner.lock().await.responses.len()
    }

    /// Clear a domain's retry backoff, for test assertions around requeue.
    pub async fn clear_backoff(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(d) = inner.domains.get_mut(&id) {
            d.next_attempt_at = None;
        }
        Ok(())
    }

    /// All rows for one domain, for test assertions.
    pub async fn responses_for(&self, domain_id: Uuid) -> Vec<ResponseRow> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<ResponseRow> = inner
            .responses
            .values()
            .filter(|r| r.domain_id == domain_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.prompt_id, &a.model).cmp(&(&b.prompt_id, &b.model)));
        rows
    }
}

fn claimable(d: &Domain, now: DateTime<Utc>) -> bool {
    match d.status {
        DomainStatus::Pending => d.next_attempt_at.is_none_or(|t| t <= now),
        DomainStatus::Processing => d.claim_deadline.is_some_and(|t| t < now),
        _ => false,
    }
}

#[async_trait]
impl Database for MemoryBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn insert_domain(
        &self,
        host: &str,
        source: Option<&str>,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let host = canonical_host(host);
        let mut inner = self.inner.lock().await;
        if inner.domains.values().any(|d| d.host == host) {
            return Ok(None);
        }
        let now = Utc::now();
        let id = Uuid::new_v4();
        inner.domains.insert(
            id,
            Domain {
                id,
                host,
                status: DomainStatus::Pending,
                source: source.map(str::to_string),
                attempt_count: 0,
                last_error: None,
                claim_holder: None,
                claim_deadline: None,
                next_attempt_at: None,
                last_processed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(Some(id))
    }

    async fn get_domain(&self, id: Uuid) -> Result<Option<Domain>, DatabaseError> {
        Ok(self.inner.lock().await.domains.get(&id).cloned())
    }

    async fn claim_domains(
        &self,
        worker_id: &str,
        batch_size: i64,
        claim_ttl: Duration,
    ) -> Result<Vec<Domain>, DatabaseError> {
        let now = Utc::now();
        let deadline = now + chrono::Duration::milliseconds(claim_ttl.as_millis() as i64);
        let mut inner = self.inner.lock().await;

        let mut eligible: Vec<Uuid> = inner
            .domains
            .values()
            .filter(|d| claimable(d, now))
            .map(|d| d.id)
            .collect();
        // Oldest last_processed_at first (never-processed sorts first),
        // ties broken by id.
        eligible.sort_by_key(|id| {
            let d = &inner.domains[id];
            (d.last_processed_at, d.id)
        });
        eligible.truncate(batch_size.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let d = inner.domains.get_mut(&id).expect("eligible id present");
            d.status = DomainStatus::Processing;
            d.claim_holder = Some(worker_id.to_string());
            d.claim_deadline = Some(deadline);
            d.attempt_count += 1;
            d.updated_at = now;
            claimed.push(d.clone());
        }
        Ok(claimed)
    }

    async fn release_domain(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(d) = inner.domains.get_mut(&id)
            && d.status == DomainStatus::Processing
            && d.claim_holder.as_deref() == Some(worker_id)
        {
            d.status = DomainStatus::Pending;
            d.claim_holder = None;
            d.claim_deadline = None;
            d.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_domain(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(d) = inner.domains.get_mut(&id)
            && d.status == DomainStatus::Processing
            && d.claim_holder.as_deref() == Some(worker_id)
        {
            let now = Utc::now();
            d.status = DomainStatus::Completed;
            d.last_processed_at = Some(now);
            d.last_error = None;
            d.claim_holder = None;
            d.claim_deadline = None;
            d.updated_at = now;
        } else {
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
        let mut inner = self.inner.lock().await;
        let Some(d) = inner.domains.get_mut(&id) else {
            return Ok(DomainStatus::Pending);
        };
        if d.status != DomainStatus::Processing || d.claim_holder.as_deref() != Some(worker_id) {
            return Ok(DomainStatus::Pending);
        }
        let now = Utc::now();
        d.last_error = Some(error.to_string());
        d.last_processed_at = Some(now);
        d.claim_holder = None;
        d.claim_deadline = None;
        d.updated_at = now;
        if d.attempt_count >= max_attempts {
            d.status = DomainStatus::Error;
            d.next_attempt_at = None;
        } else {
            d.status = DomainStatus::Pending;
            d.next_attempt_at =
                Some(now + chrono::Duration::milliseconds(backoff.as_millis() as i64));
        }
        Ok(d.status)
    }

    async fn reset_stuck(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let mut reclaimed = 0;
        for d in inner.domains.values_mut() {
            if d.status == DomainStatus::Processing && d.claim_deadline.is_some_and(|t| t < now) {
                d.status = DomainStatus::Pending;
                d.claim_holder = None;
                d.claim_deadline = None;
                d.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn reopen_domain(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        match inner.domains.get_mut(&id) {
            Some(d) => {
                d.status = DomainStatus::Pending;
                d.attempt_count = 0;
                d.last_error = None;
                d.claim_holder = None;
                d.claim_deadline = None;
                d.next_attempt_at = None;
                d.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_count(&self) -> Result<i64, DatabaseError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .domains
            .values()
            .filter(|d| d.status == DomainStatus::Pending && d.next_attempt_at.is_none_or(|t| t <= now))
            .count() as i64)
    }

    async fn insert_response(&self, row: &ResponseRow) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner.responses.contains_key(&row.id) {
            return Ok(false);
        }
        inner.responses.insert(row.id, row.clone());
        Ok(true)
    }

    async fn satisfied_cells(
        &self,
        domain_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<CellOutcome>, DatabaseError> {
        let inner = self.inner.lock().await;
        let mut by_cell: HashMap<(String, String), ResponseOutcome> = HashMap::new();
        for row in inner
            .responses
            .values()
            .filter(|r| r.domain_id == domain_id && r.created_at >= since)
        {
            by_cell
                .entry((row.prompt_id.clone(), row.model.clone()))
                .and_modify(|existing| {
                    if row.outcome == ResponseOutcome::Ok {
                        *existing = ResponseOutcome::Ok;
                    }
                })
                .or_insert(row.outcome);
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
        let inner = self.inner.lock().await;
        Ok(inner
            .domains
            .values()
            .filter(|d| {
                d.status == DomainStatus::Completed
                    && d.last_processed_at.is_some_and(|t| t >= since)
            })
            .cloned()
            .collect())
    }

    async fn provider_error_rates(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ModelStats>, DatabaseError> {
        let inner = self.inner.lock().await;
        let mut by_model: HashMap<String, (i64, i64)> = HashMap::new();
        for row in inner.responses.values().filter(|r| r.created_at >= since) {
            let entry = by_model.entry(row.model.clone()).or_default();
            entry.0 += 1;
            if row.outcome == ResponseOutcome::PermanentError {
                entry.1 += 1;
            }
        }
        let mut stats: Vec<ModelStats> = by_model
            .into_iter()
            .map(|(model, (total, permanent_errors))| ModelStats {
                model,
                total,
                permanent_errors,
            })
            .collect();
        stats.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{minute_bucket, response_row_id};

    fn row(domain_id: Uuid, prompt_id: &str, model: &str, outcome: ResponseOutcome) -> ResponseRow {
        let now = Utc::now();
        ResponseRow {
            id: response_row_id(domain_id, prompt_id, model, minute_bucket(now)),
            domain_id,
            prompt_id: prompt_id.to_string(),
            model: model.to_string(),
            response: "body".to_string(),
            outcome,
            tokens_in: Some(10),
            tokens_out: Some(5),
            latency_ms: 100,
            key_index: 0,
            attempt: 1,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_domain_dedupes_case_folded() {
        let db = MemoryBackend::new();
        let first = db.insert_domain("Example.com", None).await.unwrap();
        let second = db.insert_domain("example.COM", None).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_claim_marks_processing_and_excludes_others() {
        let db = MemoryBackend::new();
        db.insert_domain("a.com", None).await.unwrap();
        db.insert_domain("b.com", None).await.unwrap();

        let first = db
            .claim_domains("w1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|d| d.status == DomainStatus::Processing));

        let second = db
            .claim_domains("w2", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_empty(), "live claims must not be re-claimable");
    }

    #[tokio::test]
    async fn test_expired_claim_is_reclaimable() {
        let db = MemoryBackend::new();
        db.insert_domain("a.com", None).await.unwrap();

        let first = db
            .claim_domains("w1", 1, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = db
            .claim_domains("w2", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].claim_holder.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_claim_order_prefers_oldest_processed() {
        let db = MemoryBackend::new();
        let a = db.insert_domain("a.com", None).await.unwrap().unwrap();
        let b = db.insert_domain("b.com", None).await.unwrap().unwrap();

        // Complete b so it carries a last_processed_at; a stays fresh.
        let claimed = db
            .claim_domains("w1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        db.complete_domain(b, "w1").await.unwrap();
        db.release_domain(a, "w1").await.unwrap();
        db.reopen_domain(b).await.unwrap();

        let next = db
            .claim_domains("w2", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(next[0].id, a, "never-processed domains claim first");
    }

    #[tokio::test]
    async fn test_complete_requires_holder() {
        let db = MemoryBackend::new();
        let id = db.insert_domain("a.com", None).await.unwrap().unwrap();
        db.claim_domains("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();

        db.complete_domain(id, "intruder").await.unwrap();
        let d = db.get_domain(id).await.unwrap().unwrap();
        assert_eq!(d.status, DomainStatus::Processing);

        db.complete_domain(id, "w1").await.unwrap();
        let d = db.get_domain(id).await.unwrap().unwrap();
        assert_eq!(d.status, DomainStatus::Completed);
        assert!(d.claim_holder.is_none());
    }

    #[tokio::test]
    async fn test_claim_counts_processing_rounds() {
        let db = MemoryBackend::new();
        let id = db.insert_domain("a.com", None).await.unwrap().unwrap();

        let claimed = db
            .claim_domains("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed[0].attempt_count, 1);
        db.complete_domain(id, "w1").await.unwrap();
        assert_eq!(db.get_domain(id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_fail_backoff_then_terminal() {
        let db = MemoryBackend::new();
        let id = db.insert_domain("a.com", None).await.unwrap().unwrap();

        // Round 1: fail below the cap -> pending with backoff.
        db.claim_domains("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let status = db
            .fail_domain(id, "w1", "no coverage", 2, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(status, DomainStatus::Pending);

        // Inside the backoff window the domain is not claimable.
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert!(
            db.claim_domains("w2", 1, Duration::from_secs(60))
                .await
                .unwrap()
                .is_empty()
        );

        // Round 2: clear the backoff, fail at the cap -> terminal.
        db.clear_backoff(id).await.unwrap();
        db.claim_domains("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let status = db
            .fail_domain(id, "w1", "still failing", 2, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(status, DomainStatus::Error);

        let d = db.get_domain(id).await.unwrap().unwrap();
        assert_eq!(d.attempt_count, 2);
        assert_eq!(d.last_error.as_deref(), Some("still failing"));
        // Terminal domains are not claimable.
        assert!(
            db.claim_domains("w1", 1, Duration::from_secs(60))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_reset_stuck_only_touches_expired() {
        let db = MemoryBackend::new();
        db.insert_domain("stuck.com", None).await.unwrap();
        db.insert_domain("live.com", None).await.unwrap();

        let stuck = db
            .claim_domains("w1", 1, Duration::from_millis(0))
            .await
            .unwrap();
        let live = db
            .claim_domains("w2", 1, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(live.len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = db.reset_stuck(Utc::now()).await.unwrap();
        assert_eq!(reclaimed, 1);

        let still_live = db.get_domain(live[0].id).await.unwrap().unwrap();
        assert_eq!(still_live.status, DomainStatus::Processing);
    }

    #[tokio::test]
    async fn test_insert_response_idempotent() {
        let db = MemoryBackend::new();
        let domain_id = Uuid::new_v4();
        let r = row(domain_id, "p1", "gpt-4o", ResponseOutcome::Ok);
        assert!(db.insert_response(&r).await.unwrap());
        assert!(!db.insert_response(&r).await.unwrap());
        assert_eq!(db.response_count().await, 1);
    }

    #[tokio::test]
    async fn test_satisfied_cells_ok_dominates() {
        let db = MemoryBackend::new();
        let domain_id = Uuid::new_v4();

        let mut perm = row(domain_id, "p1", "gpt-4o", ResponseOutcome::PermanentError);
        perm.id = Uuid::new_v4();
        db.insert_response(&perm).await.unwrap();
        let ok = row(domain_id, "p1", "gpt-4o", ResponseOutcome::Ok);
        db.insert_response(&ok).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let cells = db.satisfied_cells(domain_id, since).await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].outcome, ResponseOutcome::Ok);
    }

    #[tokio::test]
    async fn test_error_rates_grouped_by_model() {
        let db = MemoryBackend::new();
        let domain_id = Uuid::new_v4();
        db.insert_response(&row(domain_id, "p1", "gpt-4o", ResponseOutcome::Ok))
            .await
            .unwrap();
        db.insert_response(&row(
            domain_id,
            "p2",
            "gpt-4o",
            ResponseOutcome::PermanentError,
        ))
        .await
        .unwrap();
        db.insert_response(&row(domain_id, "p1", "claude-sonnet-4", ResponseOutcome::Ok))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let stats = db.provider_error_rates(since).await.unwrap();
        assert_eq!(stats.len(), 2);
        let gpt = stats.iter().find(|s| s.model == "gpt-4o").unwrap();
        assert_eq!(gpt.total, 2);
        assert_eq!(gpt.permanent_errors, 1);
    }
}
