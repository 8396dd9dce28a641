//! Run mode: the reconciliation daemon.
//!
//! On start the daemon:
//! 1. Opens the state store under the data directory
//! 2. Resumes any lifecycle transition a previous run left in progress
//! 3. Creates or updates each declared cluster so it matches its file
//! 4. Reconciles every ACTIVE cluster on the tick interval until Ctrl-C
//!
//! The fleet itself is simulated in memory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use fleet_core::config::ClusterFile;
use fleet_core::{payload_digest, validate_cluster, EngineConfig};
use fleetgrid_autoscale::{DemandSignal, StaticDemand};
use fleetgrid_lifecycle::{CreateRequest, LifecycleError, Orchestrator, UpdateRequest};
use fleetgrid_provider::InMemoryProvider;
use fleetgrid_state::{ClusterStatus, ClusterSummary, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::demand::FileDemand;

pub struct RunOptions {
    pub data_dir: PathBuf,
    pub cluster_configs: Vec<PathBuf>,
    pub demand: Option<PathBuf>,
    pub tick_interval: Option<String>,
}

pub async fn run(options: RunOptions) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");
    std::fs::create_dir_all(&options.data_dir)?;
    let db_path = options.data_dir.join("fleetgrid.redb");

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let files = options
        .cluster_configs
        .iter()
        .map(|path| ClusterFile::from_file(path).map_err(|e| e.context(format!("load {}", path.display()))))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut engine = engine_config(&files)?;
    if let Some(interval) = options.tick_interval {
        engine.tick_interval = interval;
    }

    let provider = Arc::new(InMemoryProvider::new());
    info!("in-memory fleet provider initialized");

    let demand: Arc<dyn DemandSignal> = match options.demand {
        Some(path) => {
            info!(path = %path.display(), "reading demand from file");
            Arc::new(FileDemand::new(path))
        }
        None => Arc::new(StaticDemand::new()),
    };

    let orchestrator = Orchestrator::new(state, provider, demand, engine);

    let resumed = orchestrator.recover().await?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "resumed interrupted transitions");
    }

    for file in &files {
        match apply(&orchestrator, file).await {
            Ok(summary) => info!(cluster = %summary.name, status = %summary.status, "cluster declaration applied"),
            Err(e) => error!(cluster = %file.name, error = %e, "failed to apply cluster declaration"),
        }
    }

    // ── Reconciliation loop ────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = orchestrator.clone();
    let loop_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}

/// All cluster files must agree on engine settings; they share one engine.
fn engine_config(files: &[ClusterFile]) -> anyhow::Result<EngineConfig> {
    let Some(first) = files.first() else {
        return Ok(EngineConfig::default());
    };
    if let Some(other) = files.iter().find(|f| f.engine != first.engine) {
        bail!(
            "clusters '{}' and '{}' declare different [engine] settings",
            first.name,
            other.name
        );
    }
    Ok(first.engine.clone())
}

/// Create the cluster, or update it when its declared topology changed.
async fn apply(orchestrator: &Orchestrator, file: &ClusterFile) -> anyhow::Result<ClusterSummary> {
    let topology = validate_cluster(&file.name, &file.topology)?;
    let digest = payload_digest("topology", &topology)?;

    let current = match orchestrator.describe(&file.name).await {
        Ok(description) if description.summary.status != ClusterStatus::Deleted => description,
        Ok(_) | Err(LifecycleError::NotFound(_)) => {
            let summary = orchestrator
                .create(CreateRequest {
                    name: file.name.clone(),
                    topology: file.topology.clone(),
                    token: None,
                })
                .await?;
            return Ok(summary);
        }
        Err(e) => return Err(e.into()),
    };

    match current.summary.status {
        ClusterStatus::Active | ClusterStatus::UpdateFailed if current.topology_digest != digest => {
            let summary = orchestrator
                .update(UpdateRequest {
                    name: file.name.clone(),
                    topology: file.topology.clone(),
                    token: None,
                })
                .await?;
            Ok(summary)
        }
        ClusterStatus::Active => {
            debug!(cluster = %file.name, "cluster already matches its declaration");
            Ok(current.summary)
        }
        status => {
            warn!(cluster = %file.name, %status, "cluster not updatable, declaration left pending");
            Ok(current.summary)
        }
    }
}
