//! fleetd — the FleetGrid daemon.
//!
//! Single binary over the FleetGrid crates:
//! - `validate` checks a cluster file and reports every violation
//! - `run` applies cluster files and reconciles them until interrupted
//! - `status` lists clusters persisted in a data directory
//!
//! # Usage
//!
//! ```text
//! fleetd validate cluster.toml
//! fleetd run --data-dir /var/lib/fleetgrid --cluster-config cluster.toml --demand demand.toml
//! fleetd status --data-dir /var/lib/fleetgrid --status ACTIVE
//! ```

mod daemon;
mod demand;

use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use fleet_core::config::ClusterFile;
use fleet_core::validate_cluster;
use fleetgrid_state::{ClusterStatus, StateStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid fleet reconciliation daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a cluster file without touching any state.
    Validate {
        /// Path to the cluster TOML file.
        file: PathBuf,
    },

    /// Apply cluster files and run the reconciliation loop.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Cluster file to create or update on start. Repeatable.
        #[arg(long = "cluster-config")]
        cluster_configs: Vec<PathBuf>,

        /// TOML file with per-resource demand, re-read every tick.
        #[arg(long)]
        demand: Option<PathBuf>,

        /// Override the engine tick interval (e.g. "30s").
        #[arg(long)]
        tick_interval: Option<String>,
    },

    /// List persisted clusters.
    Status {
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Only show clusters in this status (e.g. ACTIVE). Without it,
        /// DELETED clusters are hidden.
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate { file } => validate(file),
        Command::Run {
            data_dir,
            cluster_configs,
            demand,
            tick_interval,
        } => {
            daemon::run(daemon::RunOptions {
                data_dir,
                cluster_configs,
                demand,
                tick_interval,
            })
            .await
        }
        Command::Status { data_dir, status } => status_report(data_dir, status),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let file = ClusterFile::from_file(&path)?;
    match validate_cluster(&file.name, &file.topology) {
        Ok(topology) => {
            let resources = topology.resource_keys().len();
            println!(
                "{}: cluster '{}' is valid ({} queue(s), {resources} compute resource(s))",
                path.display(),
                file.name,
                topology.queues.len()
            );
            Ok(())
        }
        Err(e) => {
            for violation in &e.violations {
                eprintln!("{}: {violation}", path.display());
            }
            bail!("{} violation(s) found", e.violations.len())
        }
    }
}

fn status_report(data_dir: PathBuf, status: Option<String>) -> anyhow::Result<()> {
    let filter = status
        .map(|s| ClusterStatus::parse(&s).ok_or_else(|| anyhow!("unknown cluster status '{s}'")))
        .transpose()?;

    let state = StateStore::open(&data_dir.join("fleetgrid.redb"))?;
    let summaries: Vec<_> = state
        .list_clusters()?
        .iter()
        .filter(|r| match filter {
            Some(wanted) => r.status == wanted,
            None => r.status != ClusterStatus::Deleted,
        })
        .map(|r| r.summary())
        .collect();

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
