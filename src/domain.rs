//! Core records: queued domains, grid cells, and response rows.
//!
//! A *cell* is the unit of coverage: the triple (prompt, provider, model)
//! for one domain. A domain is complete for a window once enough of its
//! cells carry an `ok` response row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic response-row ids.
const RESPONSE_NS: Uuid = Uuid::from_u128(0x5e21_7a84_66d0_4c35_a6d7_42f1_9b30_c8d1);

/// Queue state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker, claim deadline set.
    Processing,
    /// Coverage threshold met within the window.
    Completed,
    /// Retries exhausted; terminal unless explicitly reopened.
    Error,
}

impl std::fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for DomainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown domain status '{other}'")),
        }
    }
}

/// A row of the `domains` work queue.
#[derive(Debug, Clone)]
pub struct Domain {
    pub id: Uuid,
    /// Canonical hostname, case-folded, unique.
    pub host: String,
    pub status: DomainStatus,
    /// Where the domain came from (seed file, referral, manual).
    pub source: Option<String>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    /// Worker currently holding the claim, when status is `processing`.
    pub claim_holder: Option<String>,
    /// When the claim expires and becomes reclaimable.
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Earliest next claim time while backing off after a failure.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical form of a hostname: trimmed, case-folded, no trailing dot.
pub fn canonical_host(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// One coordinate of the coverage grid within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cell {
    pub prompt_id: String,
    pub provider: String,
    pub model: String,
}

/// Terminal outcome of a cell attempt that produced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Real content captured.
    Ok,
    /// The provider failed permanently for this cell; the row records the
    /// error descriptor so the cell is not retried within the window.
    PermanentError,
}

impl std::fmt::Display for ResponseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::PermanentError => write!(f, "permanent_error"),
        }
    }
}

impl std::str::FromStr for ResponseOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "permanent_error" => Ok(Self::PermanentError),
            other => Err(format!("unknown response outcome '{other}'")),
        }
    }
}

/// A normalized response row. Append-only; never updated.
#[derive(Debug, Clone)]
pub struct ResponseRow {
    /// Deterministic: see [`response_row_id`].
    pub id: Uuid,
    pub domain_id: Uuid,
    pub prompt_id: String,
    pub model: String,
    /// Raw provider content for `ok`; a structured error descriptor
    /// (kind + message) for `permanent_error`.
    pub response: String,
    pub outcome: ResponseOutcome,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub latency_ms: i64,
    /// Which key in the provider's pool served the final attempt.
    pub key_index: i32,
    /// 1-based attempt number that produced this row.
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
}

/// Wall-clock minute bucket used to derive deterministic row ids.
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

/// Deterministic response-row id: one per (domain, prompt, model, minute).
///
/// Two attempts landing in the same minute derive the same id, so the
/// second insert is a no-op.
pub fn response_row_id(domain_id: Uuid, prompt_id: &str, model: &str, bucket: i64) -> Uuid {
    let key = format!("{domain_id}:{prompt_id}:{model}:{bucket}");
    Uuid::new_v5(&RESPONSE_NS, key.as_bytes())
}
