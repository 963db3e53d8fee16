//! Schedule mode — place one batch and print the destinations.
//!
//! The store is opened exclusively, so this mode only runs while no
//! compute agent holds it. Next to a running agent use standalone mode.

use std::path::{Path, PathBuf};

use anyhow::Context;
use kestrel_core::{Container, ExtraSpec, KestrelConfig};
use kestrel_scheduler::SchedulerDriver;
use serde::Deserialize;

/// Contents of the `--request` file.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub containers: Vec<Container>,
    #[serde(default)]
    pub extra_spec: ExtraSpec,
    /// Preferred hosts, in order.
    #[serde(default)]
    pub candidates: Option<Vec<String>>,
}

pub async fn run_schedule(
    config: KestrelConfig,
    data_dir: PathBuf,
    request_path: &Path,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(request_path)
        .with_context(|| format!("reading request {}", request_path.display()))?;
    let request: ScheduleRequest = serde_json::from_str(&raw)
        .with_context(|| format!("parsing request {}", request_path.display()))?;

    let store = crate::open_store(&data_dir)?;
    let driver = SchedulerDriver::from_config(&config, store)?;
    let destinations = driver
        .select_destinations(
            &request.containers,
            &request.extra_spec,
            request.candidates.as_deref(),
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&destinations)?);
    Ok(())
}
