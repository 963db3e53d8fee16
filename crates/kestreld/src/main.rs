//! kestreld — the Kestrel daemon.
//!
//! - `compute`: tracks one host's resources, runs the periodic audit and
//!   the service heartbeat until interrupted
//! - `schedule`: places one batch of containers and prints the
//!   destinations as JSON
//! - `standalone`: the compute agent plus a scheduler reading requests
//!   from stdin, for a single node
//!
//! The state store file is held by one process at a time. `compute` and
//! `standalone` hold it while they run; `schedule` only opens it while
//! neither is running.
//!
//! # Usage
//!
//! ```text
//! kestreld --config /etc/kestrel/kestrel.toml compute --inventory host.toml
//! kestreld --config /etc/kestrel/kestrel.toml schedule --request batch.json
//! kestreld --config /etc/kestrel/kestrel.toml standalone --inventory host.toml < requests.jsonl
//! ```

mod compute_mode;
mod schedule_mode;
mod standalone_mode;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kestrel_core::KestrelConfig;
use kestrel_state::StateStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,kestreld=debug,kestrel=debug";

#[derive(Parser)]
#[command(name = "kestreld", about = "Kestrel container control plane daemon")]
struct Cli {
    /// Path to kestrel.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the state store.
    #[arg(long, global = true, default_value = "/var/lib/kestrel")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the compute node agent.
    Compute {
        /// Hostname to report as. Overrides `compute.host`.
        #[arg(long)]
        host: Option<String>,

        /// Host inventory TOML. Overrides `compute.inventory`.
        #[arg(long)]
        inventory: Option<PathBuf>,
    },
    /// Run the compute node agent and schedule requests read from stdin,
    /// one JSON object per line.
    Standalone {
        /// Hostname to report as. Overrides `compute.host`.
        #[arg(long)]
        host: Option<String>,

        /// Host inventory TOML. Overrides `compute.inventory`.
        #[arg(long)]
        inventory: Option<PathBuf>,
    },
    /// Place a batch of containers.
    Schedule {
        /// JSON file with `containers`, `extra_spec` and optional `candidates`.
        #[arg(long)]
        request: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Compute { host, inventory } => {
            apply_host_overrides(&mut config, host, inventory);
            compute_mode::run_compute(config, cli.data_dir).await
        }
        Command::Standalone { host, inventory } => {
            apply_host_overrides(&mut config, host, inventory);
            standalone_mode::run_standalone(config, cli.data_dir).await
        }
        Command::Schedule { request } => {
            schedule_mode::run_schedule(config, cli.data_dir, &request).await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KestrelConfig> {
    match path {
        Some(path) => KestrelConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(KestrelConfig::default()),
    }
}

fn apply_host_overrides(config: &mut KestrelConfig, host: Option<String>, inventory: Option<PathBuf>) {
    if let Some(host) = host {
        config.compute.host = host;
    }
    if inventory.is_some() {
        config.compute.inventory = inventory;
    }
}

/// Open `data_dir/kestrel.redb`, creating the directory if needed.
pub(crate) fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("kestrel.redb");
    let store = StateStore::open(&db_path).with_context(|| {
        format!(
            "opening state store {}; it may be held by a running kestreld, \
             use `kestreld standalone` to schedule next to a compute agent",
            db_path.display()
        )
    })?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}
