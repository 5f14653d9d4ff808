//! promptgrid - main entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use promptgrid::config::Config;
use promptgrid::db::{self, Database};
use promptgrid::provider::ProviderAdapter;
use promptgrid::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "promptgrid",
    about = "Multi-provider LLM fan-out crawler",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the crawl engine (workers + guardian) until Ctrl-C.
    Run,
    /// Claim and process one batch synchronously; print the summary.
    ProcessBatch {
        /// Maximum domains to claim.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the number of claimable pending domains.
    PendingCount,
    /// Return expired-claim domains to pending.
    ResetStuck,
    /// Force one domain back to pending with cleared counters.
    ReopenDomain {
        /// Domain id.
        id: Uuid,
    },
    /// Insert pending domains from a hostname file (one per line,
    /// `#` comments allowed). Hostnames are case-folded and deduped.
    Seed {
        /// Path to the hostname list.
        #[arg(long)]
        file: PathBuf,
        /// Source tag recorded on each inserted domain.
        #[arg(long)]
        source: Option<String>,
    },
    /// Issue one cheap call per configured model to catch deprecated or
    /// misspelled identifiers before a crawl.
    Probe,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("promptgrid=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env()?;
    let database = db::connect_from_config(&config.database).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let supervisor = Supervisor::from_config(config, database)?;
            supervisor
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for shutdown signal");
                    }
                })
                .await;
        }
        Command::ProcessBatch { limit } => {
            let supervisor = Supervisor::from_config(config, database)?;
            let summary = supervisor.admin_worker().process_batch(limit).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::PendingCount => {
            println!("{}", database.pending_count().await?);
        }
        Command::ResetStuck => {
            let reclaimed = database.reset_stuck(chrono::Utc::now()).await?;
            println!("reclaimed {reclaimed} stuck domain(s)");
        }
        Command::ReopenDomain { id } => {
            if database.reopen_domain(id).await? {
                println!("domain {id} reopened");
            } else {
                anyhow::bail!("no domain with id {id}");
            }
        }
        Command::Seed { file, source } => {
            let content = std::fs::read_to_string(&file)?;
            let mut inserted = 0usize;
            let mut skipped = 0usize;
            for line in content.lines() {
                let host = line.trim();
                if host.is_empty() || host.starts_with('#') {
                    continue;
                }
                match database.insert_domain(host, source.as_deref()).await? {
                    Some(_) => inserted += 1,
                    None => skipped += 1,
                }
            }
            println!("seeded {inserted} domain(s), {skipped} already present");
        }
        Command::Probe => {
            let supervisor = Supervisor::from_config(config, database)?;
            let ctx = supervisor.context();
            let mut failures = 0usize;
            for provider in ctx.adapters.iter() {
                for model in &provider.config.models {
                    let result = match ctx.keys.checkout(&provider.config.name) {
                        Ok(lease) => {
                            provider
                                .adapter
                                .complete(
                                    "Reply with the single word OK.",
                                    model,
                                    &lease.secret,
                                    lease.index,
                                )
                                .await
                                .map(|_| ())
                        }
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(()) => println!("ok      {} / {model}", provider.config.name),
                        Err(e) => {
                            failures += 1;
                            println!("FAILED  {} / {model}: {e}", provider.config.name);
                        }
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{failures} model(s) failed the probe");
            }
        }
    }

    Ok(())
}
