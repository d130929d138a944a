//! TillSync orchestrator daemon and operational commands.
//!
//! Usage:
//!     tillsync-orchestrator worker [--poll-seconds 15] [--once]
//!     tillsync-orchestrator dispatch
//!     tillsync-orchestrator reconcile
//!     tillsync-orchestrator ingest-history [--days 60]
//!     tillsync-orchestrator status

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tillsync_orchestrator::credentials::TokenFileProbe;
use tillsync_orchestrator::dispatcher::{dispatch_next_queued_job, DispatchOutcome};
use tillsync_orchestrator::tenants::TenantConfigReader;
use tillsync_orchestrator::{
    health, ingest, reconciler, run_worker, scheduler_status, Orchestrator, OrchestratorConfig,
};
use tillsync_protocol::RunSource;
use tillsync_store::Store;

#[derive(Parser, Debug)]
#[command(name = "tillsync-orchestrator", about = "Run orchestration for the TillSync portal")]
struct Args {
    /// Database connection string (defaults to the state directory)
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the schedule worker loop
    Worker {
        /// Polling interval in seconds (default from SCHEDULER_POLL_SECONDS or 15)
        #[arg(long)]
        poll_seconds: Option<u64>,
        /// Process one cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Kick the dispatcher once
    Dispatch,
    /// Mark running jobs whose PID no longer exists as failed
    Reconcile,
    /// Backfill artifacts from the uploaded metadata tree
    IngestHistory {
        /// Only ingest files modified within this many days
        #[arg(long, default_value_t = 60)]
        days: i64,
    },
    /// Show scheduler liveness and per-tenant health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tillsync=info,tillsync_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = OrchestratorConfig::from_env();
    if let Some(database) = args.database {
        config.database_url = database;
    }

    tracing::info!("state root: {}", config.state_root.display());
    std::fs::create_dir_all(&config.state_root)
        .with_context(|| format!("creating state root {}", config.state_root.display()))?;

    let store = Store::open(&config.database_url)
        .await
        .context("opening the orchestration database")?;
    store.init().await.context("initializing the schema")?;

    let orch = Orchestrator::new(Arc::new(store), Arc::new(config));

    match args.command {
        Command::Worker { poll_seconds, once } => {
            run_worker(&orch, once, poll_seconds).await?;
        }
        Command::Dispatch => {
            let outcome = dispatch_next_queued_job(&orch, RunSource::Cli).await?;
            match outcome {
                DispatchOutcome::Started(job) => {
                    println!("started job {} (pid {:?})", job.id, job.pid);
                    // Keep the process alive until the monitor finishes the
                    // run; the lock and log handle belong to this process.
                    wait_for_terminal(&orch, &job.id).await?;
                }
                DispatchOutcome::SpawnFailed(job) => {
                    println!(
                        "job {} failed to start: {}",
                        job.id,
                        job.failure_reason.unwrap_or_default()
                    );
                }
                DispatchOutcome::Busy => println!("run slot busy; job left queued"),
                DispatchOutcome::Idle => println!("nothing queued"),
            }
        }
        Command::Reconcile => {
            let fixed = reconciler::reconcile_run_jobs(&orch).await?;
            println!("Reconciled {fixed} run job(s).");
        }
        Command::IngestHistory { days } => {
            let created = ingest::ingest_history(&orch, days).await?;
            println!("Ingested {created} new artifact(s).");
        }
        Command::Status => {
            print_status(&orch).await?;
        }
    }
    Ok(())
}

async fn wait_for_terminal(orch: &Orchestrator, job_id: &str) -> Result<()> {
    loop {
        match orch.store.get_job(job_id).await? {
            Some(job) if job.status.is_terminal() => {
                match job.exit_code {
                    Some(code) => {
                        let info = tillsync_protocol::exit_code_info(code);
                        println!(
                            "job {} finished: {} (exit code {code}: {})",
                            job.id, job.status, info.label
                        );
                    }
                    None => println!("job {} finished: {}", job.id, job.status),
                }
                return Ok(());
            }
            Some(_) => tokio::time::sleep(std::time::Duration::from_millis(500)).await,
            None => return Ok(()),
        }
    }
}

async fn print_status(orch: &Orchestrator) -> Result<()> {
    let status = scheduler_status(&orch.store, orch.config.poll_seconds).await;
    println!(
        "scheduler: {} ({})",
        if status.running { "running" } else { "stopped" },
        status.message
    );

    let reader = TenantConfigReader::new(orch.config.companies_dir());
    reader.import_into(&orch.store).await?;

    let refresh_days = orch
        .config
        .effective_refresh_expiring_days(&orch.store)
        .await;
    let probe = TokenFileProbe::new(orch.config.tokens_dir(), refresh_days);

    for tenant in orch.store.list_active_tenants().await? {
        let snapshot =
            health::tenant_health(orch, &probe, &tenant.tenant_key, &tenant.config_json()).await?;
        let reasons: Vec<&str> = snapshot
            .reason_codes
            .iter()
            .map(|reason| reason.as_str())
            .collect();
        println!(
            "{:<24} {:<8} activity={:<9} {}",
            tenant.tenant_key,
            snapshot.level.as_str(),
            snapshot.run_activity.as_str(),
            reasons.join(",")
        );
    }
    Ok(())
}
