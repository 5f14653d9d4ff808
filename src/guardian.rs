//! Coverage guardian: the periodic maintenance loop.
//!
//! Every cycle it (1) reclaims domains stuck in `processing` past their
//! claim deadline, (2) reopens completed domains whose grid has cells with
//! no row at all this window, and (3) audits per-provider permanent-error
//! rates, raising a structured alert (and optionally disabling the
//! provider for the next cycle) when a threshold is crossed.
//!
//! The guardian never issues LLM calls and never writes the response
//! store; it only mutates the queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::GuardianConfig;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::worker::CrawlContext;

/// What one maintenance cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Stuck domains returned to pending.
    pub reclaimed: u64,
    /// Completed domains reopened for missing cells.
    pub reopened: u64,
    /// Providers whose permanent-error rate crossed the threshold.
    pub alerts: Vec<ProviderAlert>,
}

/// One quality-audit finding.
#[derive(Debug, Clone)]
pub struct ProviderAlert {
    pub provider: String,
    pub model: String,
    pub permanent_rate: f64,
    pub total: i64,
}

/// The maintenance loop.
pub struct CoverageGuardian {
    ctx: Arc<CrawlContext>,
    config: GuardianConfig,
    shutdown: watch::Receiver<bool>,
    consecutive_failures: u32,
}

impl CoverageGuardian {
    pub fn new(
        ctx: Arc<CrawlContext>,
        config: GuardianConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            config,
            shutdown,
            consecutive_failures: 0,
        }
    }

    /// Run the maintenance loop until shutdown.
    pub async fn run(mut self) {
        tracing::info!(interval = ?self.config.interval, "guardian started");

        let mut interval = tokio::time::interval(self.config.interval);
        // The first tick fires immediately; workers have not produced
        // anything yet, so skip it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.run_cycle().await {
                Ok(report) => {
                    self.consecutive_failures = 0;
                    tracing::info!(
                        reclaimed = report.reclaimed,
                        reopened = report.reopened,
                        alerts = report.alerts.len(),
                        "guardian cycle finished"
                    );
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    tracing::error!(
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        "guardian cycle failed"
                    );
                    if self.consecutive_failures >= self.config.max_failures {
                        tracing::error!(
                            "guardian stopping after {} consecutive failures",
                            self.consecutive_failures
                        );
                        break;
                    }
                }
            }
        }
        tracing::info!("guardian exiting");
    }

    /// One maintenance cycle. Public so admin wrappers and tests can drive
    /// it directly.
    pub async fn run_cycle(&self) -> Result<CycleReport, DatabaseError> {
        let mut report = CycleReport {
            reclaimed: self.reclaim_stuck().await?,
            ..CycleReport::default()
        };
        report.reopened = self.repair_cells().await?;
        report.alerts = self.quality_audit().await?;
        Ok(report)
    }

    /// Stuck reclaim: expired claims back to pending.
    async fn reclaim_stuck(&self) -> Result<u64, DatabaseError> {
        let reclaimed = self.ctx.db.reset_stuck(Utc::now()).await?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "reclaimed stuck domains");
        }
        Ok(reclaimed)
    }

    /// Cell repair: a completed domain must have a row (either outcome) for
    /// every grid cell this window. A cell with no row at all means the
    /// worker marked complete too eagerly; reopen the domain.
    async fn repair_cells(&self) -> Result<u64, DatabaseError> {
        let window_start = self.ctx.window_start();
        let grid = self.grid_keys();
        let mut reopened = 0;

        for domain in self.ctx.db.completed_domains_since(window_start).await? {
            let satisfied: HashSet<(String, String)> = self
                .ctx
                .db
                .satisfied_cells(domain.id, window_start)
                .await?
                .into_iter()
                .map(|c| (c.prompt_id, c.model))
                .collect();
            let missing = grid.iter().filter(|k| !satisfied.contains(*k)).count();
            if missing > 0 {
                tracing::warn!(
                    domain = %domain.host,
                    missing,
                    "completed domain has uncovered cells, reopening"
                );
                if self.ctx.db.reopen_domain(domain.id).await? {
                    reopened += 1;
                }
            }
        }
        Ok(reopened)
    }

    /// Quality audit over the rolling window.
    async fn quality_audit(&self) -> Result<Vec<ProviderAlert>, DatabaseError> {
        let since = Utc::now()
            - chrono::Duration::milliseconds(self.config.audit_window.as_millis() as i64);
        let stats = self.ctx.db.provider_error_rates(since).await?;
        let provider_of = self.provider_by_model();

        let mut alerts = Vec::new();
        for stat in stats {
            if stat.total < self.config.audit_min_samples as i64 {
                continue;
            }
            let rate = stat.permanent_rate();
            if rate <= self.config.audit_threshold {
                continue;
            }
            let provider = provider_of
                .get(stat.model.as_str())
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());

            // Structured event for the external observability layer.
            tracing::warn!(
                target: "promptgrid::quality_audit",
                provider = %provider,
                model = %stat.model,
                permanent_rate = rate,
                sample_count = stat.total,
                "provider permanent-error rate above threshold"
            );

            if self.config.disable_on_alert {
                self.ctx
                    .keys
                    .disable_provider(&provider, self.config.interval);
                tracing::warn!(provider = %provider, "provider disabled for next cycle");
            }

            alerts.push(ProviderAlert {
                provider,
                model: stat.model,
                permanent_rate: rate,
                total: stat.total,
            });
        }
        Ok(alerts)
    }

    fn grid_keys(&self) -> Vec<(String, String)> {
        let mut keys = Vec::new();
        for provider in self.ctx.adapters.iter() {
            for model in &provider.config.models {
                for prompt in self.ctx.prompts.iter() {
                    keys.push((prompt.id.clone(), model.clone()));
                }
            }
        }
        keys
    }

    fn provider_by_model(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for provider in self.ctx.adapters.iter() {
            for model in &provider.config.models {
                map.insert(model.clone(), provider.config.name.clone());
            }
        }
        map
    }
}

/// Spawn the guardian as a background task.
pub fn spawn_guardian(guardian: CoverageGuardian) -> JoinHandle<()> {
    tokio::spawn(async move {
        guardian.run().await;
    })
}
