//! Test harness: scripted provider stubs and a builder wiring a full crawl
//! context over the memory backend.
//!
//! Provides:
//! - [`StubAdapter`]: a provider adapter with a scripted behavior
//!   (fail-N-then-succeed, permanent errors, auth failures, hangs)
//! - [`HarnessBuilder`]: builder for a [`Harness`] with defaults tuned for
//!   fast tests (millisecond backoffs, tight deadlines)
//!
//! Use these instead of ad-hoc stub implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::watch;

use crate::config::{
    CoverageConfig, Prompt, ProviderConfig, RateConfig, RetryConfig, Tier, TierLimits, WireKind,
    WorkerConfig,
};
use crate::db::memory::MemoryBackend;
use crate::error::ProviderError;
use crate::guardian::CoverageGuardian;
use crate::keys::KeyPool;
use crate::provider::{AdapterSet, ProviderAdapter, ProviderReply, RegisteredProvider};
use crate::rate::RateGovernor;
use crate::worker::{CrawlContext, DomainWorker};

/// Error kinds a stub can produce.
#[derive(Clone, Copy, Debug)]
pub enum StubError {
    /// 5xx-style transient failure.
    Transient,
    /// 429; the worker should cool the key.
    RateLimited,
    /// 401; the worker should quarantine the key.
    AuthFailed,
    /// Non-retryable 4xx.
    Permanent,
    /// 200 with empty content.
    Malformed,
}

/// Scripted behavior for a [`StubAdapter`].
#[derive(Clone, Debug)]
pub enum StubBehavior {
    /// Always succeed with this content.
    Ok(String),
    /// Fail `failures` times with `error`, then succeed with `response`.
    FailThenOk {
        failures: u32,
        error: StubError,
        response: String,
    },
    /// Every call fails with `error`.
    AlwaysErr(StubError),
    /// Never return; exercises caller-side deadlines.
    Hang,
}

/// A provider adapter with scripted outcomes and a call counter.
pub struct StubAdapter {
    name: String,
    behavior: StubBehavior,
    failures_remaining: AtomicU32,
    call_count: AtomicU32,
    latency: Duration,
}

impl StubAdapter {
    pub fn new(name: impl Into<String>, behavior: StubBehavior) -> Self {
        let failures = match &behavior {
            StubBehavior::FailThenOk { failures, .. } => *failures,
            _ => 0,
        };
        Self {
            name: name.into(),
            behavior,
            failures_remaining: AtomicU32::new(failures),
            call_count: AtomicU32::new(0),
            latency: Duration::from_millis(1),
        }
    }

    /// Total `complete` calls across all models.
    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    fn make_error(&self, kind: StubError, key_index: usize) -> ProviderError {
        match kind {
            StubError::Transient => ProviderError::Transient {
                provider: self.name.clone(),
                reason: "HTTP 503: overloaded".to_string(),
            },
            StubError::RateLimited => ProviderError::RateLimited {
                provider: self.name.clone(),
                // Zero cooldown keeps scripted retries deterministic.
                retry_after: Some(Duration::ZERO),
            },
            StubError::AuthFailed => ProviderError::AuthFailed {
                provider: self.name.clone(),
                key_index,
            },
            StubError::Permanent => ProviderError::Permanent {
                provider: self.name.clone(),
                reason: "HTTP 400: bad request".to_string(),
            },
            StubError::Malformed => ProviderError::Malformed {
                provider: self.name.clone(),
                reason: "200 response with empty content".to_string(),
            },
        }
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        _prompt: &str,
        _model: &str,
        _key: &SecretString,
        key_index: usize,
    ) -> Result<ProviderReply, ProviderError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        match &self.behavior {
            StubBehavior::Ok(content) => Ok(ProviderReply {
                content: content.clone(),
                tokens_in: Some(10),
                tokens_out: Some(5),
                latency: self.latency,
            }),
            StubBehavior::FailThenOk {
                error, response, ..
            } => {
                let prev = self.failures_remaining.load(Ordering::Relaxed);
                if prev > 0 {
                    let _ = self.failures_remaining.compare_exchange(
                        prev,
                        prev - 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                    return Err(self.make_error(*error, key_index));
                }
                Ok(ProviderReply {
                    content: response.clone(),
                    tokens_in: Some(10),
                    tokens_out: Some(5),
                    latency: self.latency,
                })
            }
            StubBehavior::AlwaysErr(error) => Err(self.make_error(*error, key_index)),
            StubBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Roster entry for a stub provider.
pub fn stub_provider_config(name: &str, tier: Tier, models: &[&str], keys: usize) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        kind: WireKind::Openai,
        tier,
        models: models.iter().map(|m| m.to_string()).collect(),
        base_url: "https://stub.invalid".to_string(),
        keys: (0..keys.max(1))
            .map(|i| SecretString::from(format!("stub-key-{i}")))
            .collect(),
    }
}

/// One prompt with a `{domain}` placeholder.
pub fn stub_prompt(id: &str) -> Prompt {
    Prompt {
        id: id.to_string(),
        text: format!("Tell me about {{domain}} ({id})."),
        version: 1,
    }
}

/// Assembled components ready for use in tests.
pub struct Harness {
    /// Concrete memory backend, for direct row assertions.
    pub db: Arc<MemoryBackend>,
    pub ctx: Arc<CrawlContext>,
    pub shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Harness {
    /// A worker bound to the harness context.
    pub fn worker(&self, id: &str) -> DomainWorker {
        DomainWorker::new(id, Arc::clone(&self.ctx), self.shutdown_rx.clone())
    }

    /// A guardian bound to the harness context.
    pub fn guardian(&self, config: crate::config::GuardianConfig) -> CoverageGuardian {
        CoverageGuardian::new(Arc::clone(&self.ctx), config, self.shutdown_rx.clone())
    }
}

/// Builder for a [`Harness`].
///
/// Defaults: one fast-tier provider answering "OK", one prompt,
/// millisecond retry backoffs, full-coverage completion, 60 s claim TTL.
pub struct HarnessBuilder {
    providers: Vec<RegisteredProvider>,
    prompts: Vec<Prompt>,
    worker: WorkerConfig,
    retry: RetryConfig,
    coverage: CoverageConfig,
    rate: RateConfig,
    claim_ttl: Duration,
    key_cooldown: Duration,
    key_quarantine: Duration,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            prompts: vec![stub_prompt("p1")],
            worker: WorkerConfig {
                count: 1,
                batch_size: 5,
                domain_deadline: Duration::from_secs(5),
                max_attempts: 3,
                grace: Duration::from_millis(200),
                call_timeout: Duration::from_secs(2),
                idle_delay: Duration::from_millis(10),
            },
            retry: RetryConfig {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
                max_attempts: 3,
            },
            coverage: CoverageConfig::default(),
            rate: RateConfig {
                fast: TierLimits {
                    max_in_flight: 8,
                    min_spacing: Duration::ZERO,
                },
                medium: TierLimits {
                    max_in_flight: 4,
                    min_spacing: Duration::ZERO,
                },
                slow: TierLimits {
                    max_in_flight: 2,
                    min_spacing: Duration::ZERO,
                },
            },
            claim_ttl: Duration::from_secs(60),
            key_cooldown: Duration::from_millis(1),
            key_quarantine: Duration::from_secs(600),
        }
    }

    /// Register a stub provider.
    pub fn with_provider(mut self, config: ProviderConfig, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.push(RegisteredProvider { config, adapter });
        self
    }

    pub fn with_prompts(mut self, prompts: Vec<Prompt>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_coverage(mut self, coverage: CoverageConfig) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    pub fn build(self) -> Harness {
        let mut builder = self;
        if builder.providers.is_empty() {
            let config = stub_provider_config("stub", Tier::Fast, &["stub-model"], 1);
            let adapter = Arc::new(StubAdapter::new(
                "stub",
                StubBehavior::Ok("OK".to_string()),
            ));
            builder.providers.push(RegisteredProvider {
                config,
                adapter,
            });
        }

        let provider_configs: Vec<ProviderConfig> = builder
            .providers
            .iter()
            .map(|p| p.config.clone())
            .collect();
        let adapters = Arc::new(AdapterSet::from_adapters(builder.providers));
        let keys = Arc::new(
            KeyPool::from_config(&provider_configs)
                .with_penalties(builder.key_cooldown, builder.key_quarantine),
        );
        let governor = Arc::new(RateGovernor::from_config(&provider_configs, &builder.rate));
        let db = Arc::new(MemoryBackend::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(CrawlContext {
            db: db.clone(),
            adapters,
            keys,
            governor,
            prompts: Arc::new(builder.prompts),
            worker: builder.worker,
            retry: builder.retry,
            coverage: builder.coverage,
            claim_ttl: builder.claim_ttl,
        });

        Harness {
            db,
            ctx,
            shutdown_tx,
            shutdown_rx,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_stub_adapter_fail_then_ok() {
        let stub = StubAdapter::new(
            "stub",
            StubBehavior::FailThenOk {
                failures: 2,
                error: StubError::Transient,
                response: "finally".to_string(),
            },
        );
        let key = SecretString::from("k");
        assert!(stub.complete("p", "m", &key, 0).await.is_err());
        assert!(stub.complete("p", "m", &key, 0).await.is_err());
        let reply = stub.complete("p", "m", &key, 0).await.expect("third call");
        assert_eq!(reply.content, "finally");
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn test_harness_default_build() {
        let harness = HarnessBuilder::new().build();
        assert_eq!(harness.ctx.adapters.len(), 1);
        assert_eq!(harness.ctx.prompts.len(), 1);
        let id = harness
            .db
            .insert_domain("example.com", None)
            .await
            .expect("insert")
            .expect("fresh host");
        assert!(!id.is_nil());
    }
}
