//! Standalone mode — compute agent and scheduler in one process.
//!
//! The process owns the state store, so the scheduler reads the node and
//! service rows the agent writes without opening a second handle.
//! Requests arrive on stdin, one JSON object per line. Containers placed
//! on this host are claimed before the destinations are printed; if any
//! claim of a batch fails, the claims already made are aborted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use kestrel_compute::ComputeNodeTracker;
use kestrel_core::{Destination, KestrelConfig};
use kestrel_scheduler::SchedulerDriver;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::compute_mode::ComputeAgent;
use crate::schedule_mode::ScheduleRequest;

pub async fn run_standalone(config: KestrelConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    info!(host = %config.compute.host, "Kestrel daemon starting in standalone mode");
    let store = crate::open_store(&data_dir)?;
    let agent = ComputeAgent::start(&config, store.clone()).await?;
    let driver = SchedulerDriver::from_config(&config, store)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "reading requests failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match place_and_claim(&driver, &agent.tracker, &line).await {
                    Ok(destinations) => serde_json::to_string(&destinations)?,
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "schedule request failed");
                        serde_json::json!({ "error": format!("{e:#}") }).to_string()
                    }
                };
                println!("{reply}");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    agent.stop().await;
    info!("standalone node stopped");
    Ok(())
}

/// Place one request and claim what landed on `tracker`'s host.
async fn place_and_claim(
    driver: &SchedulerDriver,
    tracker: &Arc<ComputeNodeTracker>,
    raw: &str,
) -> anyhow::Result<Vec<Destination>> {
    let request: ScheduleRequest =
        serde_json::from_str(raw).context("parsing schedule request")?;
    let destinations = driver
        .select_destinations(
            &request.containers,
            &request.extra_spec,
            request.candidates.as_deref(),
        )
        .await?;

    let mut claims = Vec::with_capacity(destinations.len());
    for (container, destination) in request.containers.iter().zip(&destinations) {
        if destination.host != tracker.hostname() {
            continue;
        }
        let mut container = container.clone();
        let pci_requests = container.pci_requests.clone();
        match tracker
            .container_claim(&mut container, &pci_requests, &destination.limits)
            .await
        {
            Ok(claim) => claims.push(claim),
            Err(e) => {
                for claim in claims {
                    if let Err(abort) = claim.abort().await {
                        warn!(error = %abort, "aborting batch claim failed");
                    }
                }
                return Err(e).with_context(|| format!("claiming container {}", container.uuid));
            }
        }
    }

    for claim in claims {
        claim.commit();
    }
    Ok(destinations)
}
