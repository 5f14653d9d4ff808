//! Domain workers: the unit of execution.
//!
//! A worker repeatedly claims a batch of domains and, for each one, fans
//! out every unsatisfied grid cell to its provider, collects results under
//! the domain deadline, persists rows as they land, and finally decides
//! completion from `ok` coverage. Provider errors are absorbed here; only
//! aggregate outcomes mutate the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::{CoverageConfig, Prompt, RetryConfig, WorkerConfig};
use crate::db::Database;
use crate::domain::{Cell, Domain, ResponseOutcome, ResponseRow, minute_bucket, response_row_id};
use crate::error::{DatabaseError, ProviderError};
use crate::keys::KeyPool;
use crate::provider::AdapterSet;
use crate::provider::retry::backoff_delay;
use crate::rate::RateGovernor;

/// How many times a store write is retried before the worker gives the
/// domain back.
const STORE_RETRIES: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Delay before retrying a failed claim query.
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Shared dependencies handed to every worker and the guardian.
pub struct CrawlContext {
    pub db: Arc<dyn Database>,
    pub adapters: Arc<AdapterSet>,
    pub keys: Arc<KeyPool>,
    pub governor: Arc<RateGovernor>,
    pub prompts: Arc<Vec<Prompt>>,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub coverage: CoverageConfig,
    /// Claim TTL; expired claims are reclaimable by the guardian and other
    /// workers.
    pub claim_ttl: Duration,
}

impl CrawlContext {
    /// Start of the current crawl window.
    pub fn window_start(&self) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::milliseconds(self.coverage.window.as_millis() as i64)
    }
}

/// Result of one `process_batch` call, the summary surfaced to admin kicks.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining_pending: i64,
}

enum DomainResult {
    Completed,
    Failed,
    /// Claim given back without a decision (storage trouble or shutdown).
    Released,
}

struct CellResult {
    cell: Cell,
    kind: CellResultKind,
}

enum CellResultKind {
    Ok {
        content: String,
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
        latency_ms: i64,
        key_index: i32,
        attempt: i32,
    },
    Permanent {
        kind: &'static str,
        message: String,
        key_index: i32,
        attempt: i32,
    },
    /// No row: the cell was abandoned (shutdown or cancellation) and stays
    /// unsatisfied.
    Missed,
}

/// One crawl worker.
pub struct DomainWorker {
    id: String,
    ctx: Arc<CrawlContext>,
    shutdown: watch::Receiver<bool>,
}

impl DomainWorker {
    pub fn new(
        id: impl Into<String>,
        ctx: Arc<CrawlContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: id.into(),
            ctx,
            shutdown,
        }
    }

    fn shutting_down(&self) -> bool {
        // A dropped sender counts as shutdown.
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Claim/process loop; returns on shutdown.
    pub async fn run(mut self) {
        tracing::info!(worker_id = %self.id, "worker started");
        loop {
            if self.shutting_down() {
                break;
            }
            match self.process_batch(self.ctx.worker.batch_size).await {
                Ok(summary) if summary.claimed == 0 => {
                    self.idle(self.ctx.worker.idle_delay).await;
                }
                Ok(summary) => {
                    tracing::debug!(
                        worker_id = %self.id,
                        claimed = summary.claimed,
                        completed = summary.completed,
                        failed = summary.failed,
                        "batch processed"
                    );
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, error = %e, "claim failed, backing off");
                    self.idle(CLAIM_RETRY_DELAY).await;
                }
            }
        }
        tracing::info!(worker_id = %self.id, "worker exiting");
    }

    async fn idle(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Claim up to `limit` domains and process each. This is also the
    /// admin-kick entry point; concurrent callers are serialized by the
    /// claim query's locking, never by application state.
    pub async fn process_batch(&self, limit: usize) -> Result<BatchSummary, DatabaseError> {
        let claimed = self
            .ctx
            .db
            .claim_domains(&self.id, limit as i64, self.ctx.claim_ttl)
            .await?;

        let mut summary = BatchSummary {
            claimed: claimed.len(),
            completed: 0,
            failed: 0,
            remaining_pending: 0,
        };

        for domain in &claimed {
            if self.shutting_down() {
                // Stop taking on work; give unprocessed claims back.
                self.ctx.db.release_domain(domain.id, &self.id).await?;
                continue;
            }
            match self.process_domain(domain).await {
                Ok(DomainResult::Completed) => summary.completed += 1,
                Ok(DomainResult::Failed) => summary.failed += 1,
                Ok(DomainResult::Released) => {}
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        domain = %domain.host,
                        error = %e,
                        "domain processing hit storage trouble, releasing claim"
                    );
                    self.ctx.db.release_domain(domain.id, &self.id).await?;
                }
            }
        }

        summary.remaining_pending = self.ctx.db.pending_count().await?;
        Ok(summary)
    }

    /// Process one claimed domain through the full cell fan-out.
    async fn process_domain(&self, domain: &Domain) -> Result<DomainResult, DatabaseError> {
        let window_start = self.ctx.window_start();

        // LOADED: figure out which cells still need a row this window.
        let satisfied = self.ctx.db.satisfied_cells(domain.id, window_start).await?;
        let satisfied_keys: std::collections::HashSet<(String, String)> = satisfied
            .iter()
            .map(|c| (c.prompt_id.clone(), c.model.clone()))
            .collect();
        let mut ok_cells = satisfied
            .iter()
            .filter(|c| c.outcome == ResponseOutcome::Ok)
            .count();

        let grid = self.build_grid();
        let total_cells = grid.len();
        let pending: Vec<Cell> = grid
            .into_iter()
            .filter(|c| !satisfied_keys.contains(&(c.prompt_id.clone(), c.model.clone())))
            .collect();

        tracing::debug!(
            worker_id = %self.id,
            domain = %domain.host,
            pending = pending.len(),
            total = total_cells,
            "dispatching cells"
        );

        // DISPATCHING: one task per pending cell, in tier order. The
        // per-provider semaphores keep actual concurrency honest. The
        // cancel channel stops further attempts at deadline or shutdown;
        // in-flight calls get the grace period to land.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for cell in pending {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown.clone();
            let cancel = cancel_rx.clone();
            let host = domain.host.clone();
            tasks.spawn(async move { attempt_cell(ctx, shutdown, cancel, host, cell).await });
        }

        // COLLECTING: persist each result as it lands, bounded by the
        // domain deadline (shrunk to the grace period on shutdown).
        let mut shutdown = self.shutdown.clone();
        let mut shutdown_seen = false;
        let mut in_grace = false;
        let mut storage_ok = true;
        let mut deadline = Box::pin(tokio::time::sleep_until(
            tokio::time::Instant::now() + self.ctx.worker.domain_deadline,
        ));

        loop {
            tokio::select! {
                _ = deadline.as_mut() => {
                    if in_grace {
                        tracing::warn!(
                            worker_id = %self.id,
                            domain = %domain.host,
                            "grace elapsed, aborting outstanding cells"
                        );
                        tasks.abort_all();
                        break;
                    }
                    tracing::warn!(
                        worker_id = %self.id,
                        domain = %domain.host,
                        "domain deadline elapsed, draining in-flight cells"
                    );
                    in_grace = true;
                    let _ = cancel_tx.send(true);
                    deadline.as_mut().reset(
                        tokio::time::Instant::now() + self.ctx.worker.grace,
                    );
                }
                changed = shutdown.changed(), if !shutdown_seen => {
                    shutdown_seen = true;
                    let stopping = changed.is_err() || *shutdown.borrow();
                    if stopping && !in_grace {
                        in_grace = true;
                        let _ = cancel_tx.send(true);
                        let grace_end = tokio::time::Instant::now() + self.ctx.worker.grace;
                        let current = deadline.deadline();
                        deadline.as_mut().reset(grace_end.min(current));
                    }
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(result) => {
                            match self.persist_cell(domain, result).await {
                                Ok(Some(ResponseOutcome::Ok)) => ok_cells += 1,
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::error!(
                                        worker_id = %self.id,
                                        domain = %domain.host,
                                        error = %e,
                                        "store unavailable, stopping fan-out"
                                    );
                                    storage_ok = false;
                                    tasks.abort_all();
                                    break;
                                }
                            }
                        }
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            tracing::error!(worker_id = %self.id, error = %e, "cell task panicked");
                        }
                    }
                }
            }
        }
        // Drain whatever the abort left behind.
        while tasks.join_next().await.is_some() {}

        if !storage_ok {
            // storage_unavailable: no decision without the rows.
            self.ctx.db.release_domain(domain.id, &self.id).await?;
            return Ok(DomainResult::Released);
        }

        // DECIDING: completion needs enough ok cells, never fewer.
        let required = self.ctx.coverage.required_cells(total_cells);
        if ok_cells >= required {
            self.ctx.db.complete_domain(domain.id, &self.id).await?;
            tracing::info!(
                worker_id = %self.id,
                domain = %domain.host,
                ok_cells,
                total_cells,
                "domain completed"
            );
            Ok(DomainResult::Completed)
        } else {
            let message = format!("coverage {ok_cells}/{total_cells}, required {required}");
            let backoff = requeue_backoff(domain.attempt_count);
            let status = self
                .ctx
                .db
                .fail_domain(
                    domain.id,
                    &self.id,
                    &message,
                    self.ctx.worker.max_attempts,
                    backoff,
                )
                .await?;
            tracing::info!(
                worker_id = %self.id,
                domain = %domain.host,
                ok_cells,
                total_cells,
                status = %status,
                "domain failed coverage"
            );
            Ok(DomainResult::Failed)
        }
    }

    /// Full grid for one domain, in dispatch order: providers fast tier
    /// first, then models, then prompts.
    fn build_grid(&self) -> Vec<Cell> {
        let mut grid = Vec::new();
        for provider in self.ctx.adapters.iter() {
            for model in &provider.config.models {
                for prompt in self.ctx.prompts.iter() {
                    grid.push(Cell {
                        prompt_id: prompt.id.clone(),
                        provider: provider.config.name.clone(),
                        model: model.clone(),
                    });
                }
            }
        }
        grid
    }

    /// Write the row for a finished cell, with a small retry budget.
    /// Returns the stored outcome, or `None` for missed cells and dropped
    /// duplicates.
    async fn persist_cell(
        &self,
        domain: &Domain,
        result: CellResult,
    ) -> Result<Option<ResponseOutcome>, DatabaseError> {
        let now = Utc::now();
        let row = match result.kind {
            CellResultKind::Missed => return Ok(None),
            CellResultKind::Ok {
                content,
                tokens_in,
                tokens_out,
                latency_ms,
                key_index,
                attempt,
            } => ResponseRow {
                id: response_row_id(
                    domain.id,
                    &result.cell.prompt_id,
                    &result.cell.model,
                    minute_bucket(now),
                ),
                domain_id: domain.id,
                prompt_id: result.cell.prompt_id,
                model: result.cell.model,
                response: content,
                outcome: ResponseOutcome::Ok,
                tokens_in,
                tokens_out,
                latency_ms,
                key_index,
                attempt,
                created_at: now,
            },
            CellResultKind::Permanent {
                kind,
                message,
                key_index,
                attempt,
            } => ResponseRow {
                id: response_row_id(
                    domain.id,
                    &result.cell.prompt_id,
                    &result.cell.model,
                    minute_bucket(now),
                ),
                domain_id: domain.id,
                prompt_id: result.cell.prompt_id,
                model: result.cell.model,
                response: serde_json::json!({ "kind": kind, "message": message }).to_string(),
                outcome: ResponseOutcome::PermanentError,
                tokens_in: None,
                tokens_out: None,
                latency_ms: 0,
                key_index,
                attempt,
                created_at: now,
            },
        };

        let outcome = row.outcome;
        let mut last_err = None;
        for retry in 0..STORE_RETRIES {
            match self.ctx.db.insert_response(&row).await {
                Ok(true) => return Ok(Some(outcome)),
                Ok(false) => {
                    // Same minute-bucket already has this cell; drop quietly.
                    tracing::debug!(
                        domain = %domain.host,
                        prompt_id = %row.prompt_id,
                        model = %row.model,
                        "duplicate row dropped"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    last_err = Some(e);
                    if retry + 1 < STORE_RETRIES {
                        tokio::time::sleep(STORE_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| DatabaseError::Query("store retries exhausted".to_string())))
    }
}

/// Run one cell to a terminal result: an `ok` reply, a permanent failure
/// after classification and retries, or a miss on cancellation.
async fn attempt_cell(
    ctx: Arc<CrawlContext>,
    shutdown: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
    host: String,
    cell: Cell,
) -> CellResult {
    let prompt_text = ctx
        .prompts
        .iter()
        .find(|p| p.id == cell.prompt_id)
        .map(|p| p.render(&host))
        .unwrap_or_default();

    if ctx.adapters.get(&cell.provider).is_none() {
        return CellResult {
            kind: CellResultKind::Permanent {
                kind: "disabled",
                message: format!("provider '{}' not registered", cell.provider),
                key_index: -1,
                attempt: 0,
            },
            cell,
        };
    }

    let max_attempts = ctx.retry.max_attempts.max(1);
    let mut last_key_index: i32 = -1;
    let mut last_error: Option<ProviderError> = None;
    let mut attempts_made: u32 = 0;

    for attempt in 1..=max_attempts {
        if *shutdown.borrow() || *cancel.borrow() {
            return CellResult {
                cell,
                kind: CellResultKind::Missed,
            };
        }
        attempts_made = attempt;

        match dispatch_once(&ctx, &cell, &prompt_text).await {
            Ok((reply, key_index)) => {
                return CellResult {
                    cell,
                    kind: CellResultKind::Ok {
                        content: reply.content,
                        tokens_in: reply.tokens_in,
                        tokens_out: reply.tokens_out,
                        latency_ms: reply.latency.as_millis() as i64,
                        key_index,
                        attempt: attempt as i32,
                    },
                };
            }
            Err((err, key_index)) => {
                if key_index >= 0 {
                    last_key_index = key_index;
                }
                match &err {
                    ProviderError::RateLimited { retry_after, .. } if key_index >= 0 => {
                        ctx.keys.report_rate_limited(
                            &cell.provider,
                            key_index as usize,
                            *retry_after,
                        );
                    }
                    ProviderError::AuthFailed { key_index, .. } => {
                        ctx.keys.report_auth_failure(&cell.provider, *key_index);
                    }
                    _ => {}
                }

                let retryable = err.retryable(attempt) && attempt < max_attempts;
                tracing::debug!(
                    provider = %cell.provider,
                    model = %cell.model,
                    attempt,
                    error = %err,
                    retryable,
                    "cell attempt failed"
                );
                last_error = Some(err);
                if !retryable {
                    break;
                }
                tokio::time::sleep(backoff_delay(attempt - 1, ctx.retry.base, ctx.retry.cap))
                    .await;
            }
        }
    }

    // Retries exhausted or a permanent classification: either way the cell
    // gets a permanent_error marker so it is not re-dispatched this window.
    let (kind, message) = match &last_error {
        Some(err) => (err.kind(), err.to_string()),
        None => ("permanent", "retry budget exhausted".to_string()),
    };
    CellResult {
        cell,
        kind: CellResultKind::Permanent {
            kind,
            message,
            key_index: last_key_index,
            attempt: attempts_made as i32,
        },
    }
}

/// One paced, keyed adapter call. The governor permit is held for the
/// duration of the call and released before any backoff sleep.
async fn dispatch_once(
    ctx: &CrawlContext,
    cell: &Cell,
    prompt_text: &str,
) -> Result<(crate::provider::ProviderReply, i32), (ProviderError, i32)> {
    let Some(provider) = ctx.adapters.get(&cell.provider) else {
        return Err((
            ProviderError::Disabled {
                provider: cell.provider.clone(),
            },
            -1,
        ));
    };
    let permit = match ctx.governor.acquire(&cell.provider).await {
        Ok(p) => p,
        Err(e) => return Err((e, -1)),
    };
    let lease = match ctx.keys.checkout(&cell.provider) {
        Ok(l) => l,
        Err(e) => return Err((e, -1)),
    };
    let key_index = lease.index as i32;
    let result = provider
        .adapter
        .complete(prompt_text, &cell.model, &lease.secret, lease.index)
        .await;
    drop(permit);
    match result {
        Ok(reply) => Ok((reply, key_index)),
        Err(e) => Err((e, key_index)),
    }
}

/// Queue-level backoff for a re-queued domain, growing with the attempt
/// count and capped at an hour.
fn requeue_backoff(attempt_count: i32) -> Duration {
    let shift = attempt_count.clamp(0, 6) as u32;
    Duration::from_secs(60)
        .saturating_mul(1u32 << shift)
        .min(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_backoff_grows_and_caps() {
        assert_eq!(requeue_backoff(0), Duration::from_secs(60));
        assert_eq!(requeue_backoff(1), Duration::from_secs(120));
        assert_eq!(requeue_backoff(3), Duration::from_secs(480));
        assert_eq!(requeue_backoff(100), Duration::from_secs(3600));
        assert_eq!(requeue_backoff(-1), Duration::from_secs(60));
    }

    #[test]
    fn test_batch_summary_serializes() {
        let summary = BatchSummary {
            claimed: 3,
            completed: 2,
            failed: 1,
            remaining_pending: 40,
        };
        let json = serde_json::to_value(&summary).expect("serialize");
        assert_eq!(json["claimed"], 3);
        assert_eq!(json["remaining_pending"], 40);
    }
}
