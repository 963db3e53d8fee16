//! Compute mode — runs on every compute host.
//!
//! In this mode, the daemon:
//! 1. Opens the state store and loads the host inventory
//! 2. Audits the host once so the compute node row exists
//! 3. Registers the compute service and starts the heartbeat loop
//! 4. Runs the periodic resource audit until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kestrel_compute::{ComputeNodeTracker, InventoryProbe, ResourceAuditor, ServiceReporter};
use kestrel_core::KestrelConfig;
use kestrel_pci::PciWhitelist;
use kestrel_state::{COMPUTE_BINARY, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// A running compute agent: the tracker plus its heartbeat and audit loops.
pub struct ComputeAgent {
    pub tracker: Arc<ComputeNodeTracker>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ComputeAgent {
    pub async fn start(config: &KestrelConfig, store: StateStore) -> anyhow::Result<Self> {
        let host = config.compute.host.clone();

        // ── Resource tracker ─────────────────────────────────────
        let inventory = config
            .compute
            .inventory
            .as_deref()
            .context("no host inventory configured (compute.inventory or --inventory)")?;
        let probe = Arc::new(InventoryProbe::from_file(inventory)?);
        let whitelist = Arc::new(PciWhitelist::from_config(&config.pci.passthrough_whitelist)?);
        let tracker = Arc::new(
            ComputeNodeTracker::new(host.clone(), store.clone(), probe, whitelist)
                .with_tracking(config.compute.resource_tracking),
        );
        tracker.update_available_resource().await?;
        info!(%host, tracking = config.compute.resource_tracking, "compute node initialized");

        // ── Shutdown signal ──────────────────────────────────────
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── Service heartbeat ────────────────────────────────────
        let reporter = ServiceReporter::new(
            store,
            host,
            COMPUTE_BINARY,
            Duration::from_secs(config.compute.report_interval_secs),
        );
        reporter.register()?;
        let heartbeat_handle = reporter.spawn(shutdown_rx.clone());

        // ── Resource audit ───────────────────────────────────────
        let auditor = ResourceAuditor::new(
            vec![tracker.clone()],
            Duration::from_secs(config.compute.update_resources_interval_secs),
        );
        let audit_handle = auditor.spawn(shutdown_rx);

        Ok(Self {
            tracker,
            shutdown_tx,
            handles: vec![heartbeat_handle, audit_handle],
        })
    }

    /// Signal the loops and wait for them to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub async fn run_compute(config: KestrelConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    info!(host = %config.compute.host, "Kestrel daemon starting in compute mode");
    let store = crate::open_store(&data_dir)?;
    let agent = ComputeAgent::start(&config, store).await?;

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    agent.stop().await;

    info!("compute node stopped");
    Ok(())
}
