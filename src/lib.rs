//! promptgrid — tiered concurrent crawl engine.
//!
//! For each domain in a persistent work queue, the engine issues the same
//! set of prompts to every configured LLM provider, persists each
//! normalized response exactly once per (domain, prompt, model,
//! minute-bucket), and marks the domain completed only when its coverage
//! threshold over the (prompt × model) grid is met.
//!
//! Module map:
//! - [`config`]: immutable startup configuration (env + roster/prompt files)
//! - [`domain`]: core records and the deterministic row-id scheme
//! - [`db`]: the work queue and response store behind a backend trait
//! - [`provider`]: per-provider HTTP adapters with a fixed error taxonomy
//! - [`keys`]: rotating per-provider credential pool
//! - [`rate`]: per-provider in-flight caps and dispatch spacing
//! - [`worker`]: claim → fan-out → collect → decide
//! - [`guardian`]: stuck reclaim, cell repair, quality audit
//! - [`supervisor`]: process lifecycle and shutdown
//! - [`testing`]: scripted stubs and a harness builder

pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod guardian;
pub mod keys;
pub mod provider;
pub mod rate;
pub mod supervisor;
pub mod testing;
pub mod worker;
