//! Supervisor: owns the lifecycle of workers and the guardian.
//!
//! Builds the shared crawl context from configuration, spawns K workers
//! plus the guardian, broadcasts shutdown over a watch channel, and
//! respawns any worker that panics. A panicked worker's claims simply time
//! out and are reclaimed by the guardian.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db::Database;
use crate::error::ProviderError;
use crate::guardian::{CoverageGuardian, spawn_guardian};
use crate::keys::KeyPool;
use crate::provider::AdapterSet;
use crate::rate::RateGovernor;
use crate::worker::{CrawlContext, DomainWorker};

/// Process owner for the crawl engine.
pub struct Supervisor {
    config: Config,
    ctx: Arc<CrawlContext>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Wire adapters, key pool, and governor from configuration.
    pub fn from_config(config: Config, db: Arc<dyn Database>) -> Result<Self, ProviderError> {
        let adapters = Arc::new(AdapterSet::from_config(
            &config.providers,
            config.worker.call_timeout,
        )?);
        let keys = Arc::new(KeyPool::from_config(&config.providers));
        let governor = Arc::new(RateGovernor::from_config(&config.providers, &config.rate));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(CrawlContext {
            db,
            adapters,
            keys,
            governor,
            prompts: Arc::new(config.prompts.clone()),
            worker: config.worker.clone(),
            retry: config.retry.clone(),
            coverage: config.coverage.clone(),
            claim_ttl: config.guardian.stuck_after,
        });

        Ok(Self {
            config,
            ctx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The shared context, for admin wrappers.
    pub fn context(&self) -> Arc<CrawlContext> {
        Arc::clone(&self.ctx)
    }

    /// A one-shot worker for admin kicks (`process_batch` from the CLI).
    /// It shares the queue's claim semantics with the resident workers, so
    /// concurrent kicks cannot double-claim.
    pub fn admin_worker(&self) -> DomainWorker {
        DomainWorker::new(
            format!("admin-{}", std::process::id()),
            Arc::clone(&self.ctx),
            self.shutdown_rx.clone(),
        )
    }

    /// A guardian bound to this supervisor's context.
    pub fn guardian(&self) -> CoverageGuardian {
        CoverageGuardian::new(
            Arc::clone(&self.ctx),
            self.config.guardian.clone(),
            self.shutdown_rx.clone(),
        )
    }

    /// Run the full engine until `shutdown_signal` resolves. Workers drain
    /// their current domain within the grace period and exit.
    pub async fn run(self, shutdown_signal: impl Future<Output = ()>) {
        let mut workers = JoinSet::new();
        let mut names: HashMap<tokio::task::Id, String> = HashMap::new();

        for n in 1..=self.config.worker.count {
            let name = format!("worker-{n}");
            let worker = DomainWorker::new(
                name.clone(),
                Arc::clone(&self.ctx),
                self.shutdown_rx.clone(),
            );
            let id = workers.spawn(worker.run()).id();
            names.insert(id, name);
        }
        let guardian_handle = spawn_guardian(self.guardian());

        tracing::info!(
            workers = self.config.worker.count,
            providers = self.ctx.adapters.len(),
            prompts = self.ctx.prompts.len(),
            "crawl engine running"
        );

        tokio::pin!(shutdown_signal);
        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    tracing::info!("shutdown requested, draining workers");
                    let _ = self.shutdown_tx.send(true);
                    break;
                }
                joined = workers.join_next_with_id() => {
                    match joined {
                        None => break,
                        Some(Ok((id, ()))) => {
                            let name = names.remove(&id).unwrap_or_default();
                            tracing::warn!(worker_id = %name, "worker exited unexpectedly");
                        }
                        Some(Err(e)) if e.is_panic() => {
                            let name = names
                                .remove(&e.id())
                                .unwrap_or_else(|| "worker-?".to_string());
                            tracing::error!(worker_id = %name, "worker panicked, respawning");
                            let worker = DomainWorker::new(
                                name.clone(),
                                Arc::clone(&self.ctx),
                                self.shutdown_rx.clone(),
                            );
                            let id = workers.spawn(worker.run()).id();
                            names.insert(id, name);
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "worker join error");
                        }
                    }
                }
            }
        }

        // Drain: workers honor the grace period themselves.
        while workers.join_next().await.is_some() {}
        if let Err(e) = guardian_handle.await
            && e.is_panic()
        {
            tracing::error!("guardian panicked during shutdown");
        }
        tracing::info!("crawl engine stopped");
    }
}
