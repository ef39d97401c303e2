//! memtided — the memtide daemon.
//!
//! Assembles the controller from its configuration:
//! - Platform backend and capacity provisioner (resolved by name)
//! - Controller state store (redb)
//! - Scheduling loop
//!
//! # Usage
//!
//! ```text
//! memtided run --config /etc/memtide/memtide.toml --apply
//! memtided state --state-path /var/lib/memtide/memtide.redb
//! ```

mod backends;

use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use memtide_controller::Controller;
use memtide_core::ControllerConfig;
use memtide_state::{StateError, StateStore};

const DEFAULT_LOG_FILTER: &str = "info,memtided=debug,memtide=debug";

#[derive(Parser)]
#[command(name = "memtided", about = "Elastic VM memory controller")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
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
    /// Run the controller until interrupted.
    Run {
        /// Configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log resizes and migrations without performing them.
        #[arg(long, conflicts_with = "apply")]
        dry_run: bool,

        /// Perform resizes and migrations.
        #[arg(long)]
        apply: bool,

        /// Parallel VM evaluations per cycle.
        #[arg(long)]
        workers: Option<usize>,

        /// Controller state file.
        #[arg(long)]
        state_path: Option<PathBuf>,
    },

    /// Print the persisted controller state as JSON.
    State {
        /// Configuration file used to locate the state file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Controller state file; overrides the configured path.
        #[arg(long)]
        state_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            dry_run,
            apply,
            workers,
            state_path,
        } => {
            let mut config = load_config(config.as_deref())?;
            if dry_run {
                config.dry_run = true;
            }
            if apply {
                config.dry_run = false;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(path) = state_path {
                config.state.path = path;
            }
            config.validate()?;
            run(config).await
        }
        Command::State { config, state_path } => {
            let config = load_config(config.as_deref())?;
            let path = state_path.unwrap_or(config.state.path);
            print_state(&path)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => {
            let config = ControllerConfig::from_file(path)?;
            info!(?path, "configuration loaded");
            Ok(config)
        }
        None => Ok(ControllerConfig::default()),
    }
}

async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    info!(dry_run = config.dry_run, "memtide controller starting");

    let platform = backends::platform(&config)?;
    let provisioner = backends::provisioner(&config)?;
    let store = StateStore::open_or_reset(&config.state.path)?;
    info!(path = ?config.state.path, "state store opened");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let controller = Controller::new(config, platform, provisioner, store, shutdown_rx)?;
    controller.run().await;

    info!("memtide controller stopped");
    Ok(())
}

fn print_state(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        bail!("no controller state at {}", path.display());
    }
    let store = match StateStore::open(path) {
        Ok(store) => store,
        Err(StateError::Locked(_)) => bail!(
            "controller state at {} is locked by a running memtided",
            path.display()
        ),
        Err(e) => return Err(e.into()),
    };
    let snapshot = store.load()?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
