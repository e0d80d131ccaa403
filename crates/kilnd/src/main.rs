//! kilnd — the kiln daemon.
//!
//! Keeps build-worker pools at their idle minimum and their TLS
//! certificates issued and current.
//!
//! # Usage
//!
//! ```text
//! kilnd run --config /etc/kiln/kiln.toml --data-dir /var/lib/kiln
//! kilnd status --data-dir /var/lib/kiln
//! kilnd access --config /etc/kiln/kiln.toml ci-runner builders
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use kiln_core::IdentityDirectory;
use kilnd::settings::{ca_settings, fleet_settings, issuer_settings, load_config};
use kilnd::{Reconciler, open_store, parse_phase, parse_worker_ref, seed_pools, status};
use kilngrid_pki::CaManager;

#[derive(Parser)]
#[command(name = "kilnd", about = "Kiln worker fleet and certificate daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation loop until interrupted.
    Run {
        /// Path to kiln.toml. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/kiln")]
        data_dir: PathBuf,
    },

    /// Print every pool with its fleet and certificate status as JSON.
    Status {
        #[arg(long, default_value = "/var/lib/kiln")]
        data_dir: PathBuf,
    },

    /// Check whether a subject may use a pool. Exits non-zero when denied.
    Access {
        #[arg(long)]
        config: PathBuf,

        subject: String,

        pool: String,
    },

    /// Record a worker phase transition (`<namespace>/<pool>/<worker>`).
    WorkerPhase {
        #[arg(long, default_value = "/var/lib/kiln")]
        data_dir: PathBuf,

        worker: String,

        /// provisioning, idle, allocated or failed.
        phase: String,
    },

    /// Replace a namespace's CA. Every certificate in it is reissued on
    /// the next round.
    RotateCa {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "/var/lib/kiln")]
        data_dir: PathBuf,

        namespace: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await?,
        Command::Status { data_dir } => {
            let store = open_store(&data_dir)?;
            let report = status::collect(&store)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Access {
            config,
            subject,
            pool,
        } => {
            let config = load_config(Some(&config))?;
            let directory = IdentityDirectory::from_config(&config.identities);
            if !directory.is_permitted(&subject, &pool) {
                println!("denied: {subject} may not use pool {pool}");
                return Ok(ExitCode::FAILURE);
            }
            println!("permitted: {subject} may use pool {pool}");
        }
        Command::WorkerPhase {
            data_dir,
            worker,
            phase,
        } => {
            let worker = parse_worker_ref(&worker)?;
            let phase = parse_phase(&phase)?;
            let store = open_store(&data_dir)?;
            let record = store.set_worker_phase(&worker, phase, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::RotateCa {
            config,
            data_dir,
            namespace,
        } => {
            let config = load_config(config.as_deref())?;
            let store = Arc::new(open_store(&data_dir)?);
            let ca = CaManager::new(store, ca_settings(&config.pki)).regenerate_ca(&namespace, Utc::now())?;
            println!("CA for {namespace} replaced, valid until {}", ca.not_after());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kilnd=debug,kilngrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: Option<PathBuf>, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("kiln daemon starting");

    let config = load_config(config.as_deref())?;
    let store = Arc::new(open_store(&data_dir)?);
    let seeded = seed_pools(&store, &config)?;
    info!(pools = seeded, "configured pools seeded");

    let reconciler = Reconciler::new(
        store,
        fleet_settings(&config.fleet),
        ca_settings(&config.pki),
        issuer_settings(&config.pki),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    reconciler
        .run(config.fleet.reconcile_interval, shutdown_rx)
        .await;

    info!("kiln daemon stopped");
    Ok(())
}
