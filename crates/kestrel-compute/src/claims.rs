//! Resource claims.
//!
//! A claim is returned once the tracker has tested a request against the
//! host and consumed it from the ledger. The caller must resolve it:
//! [`commit`](ResourceClaim::commit) keeps the resources consumed,
//! [`abort`](ResourceClaim::abort) gives them back. [`scope`](ResourceClaim::scope)
//! does both around a dispatch future.

use std::future::Future;
use std::sync::Arc;

use kestrel_core::{Container, Limits, PciRequest};
use kestrel_pci::PciDeviceStats;
use kestrel_state::ComputeNode;
use tracing::{debug, error};

use crate::error::{ComputeError, ComputeResult};
use crate::tracker::ComputeNodeTracker;

/// Amount of each resource a claim asks for. Negative for shrinking
/// updates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceDelta {
    pub memory_mb: i64,
    pub vcpus: f64,
    pub disk_gb: i64,
    pub pci_requests: Vec<PciRequest>,
}

impl ResourceDelta {
    pub fn for_container(container: &Container, pci_requests: &[PciRequest]) -> Self {
        Self {
            memory_mb: container.memory_mb() as i64,
            vcpus: container.vcpus(),
            disk_gb: container.disk_gb() as i64,
            pci_requests: pci_requests.to_vec(),
        }
    }

    /// `new - old` for memory and cpu. Disk and PCI devices are not
    /// resized in place.
    pub fn between(new: &Container, old: &Container) -> Self {
        Self {
            memory_mb: new.memory_mb() as i64 - old.memory_mb() as i64,
            vcpus: new.vcpus() - old.vcpus(),
            disk_gb: 0,
            pci_requests: Vec::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.memory_mb == 0 && self.vcpus == 0.0 && self.disk_gb == 0 && self.pci_requests.is_empty()
    }
}

/// Test `delta` against `node` under `limits`.
///
/// An unset limit leaves that resource unconstrained. Every failed
/// constraint contributes a reason; they are joined with `"; "`.
pub fn claim_test(
    delta: &ResourceDelta,
    node: &ComputeNode,
    pci_stats: Option<&PciDeviceStats>,
    limits: &Limits,
) -> ComputeResult<()> {
    let mut reasons = Vec::new();

    let mut check = |kind: &str, unit: &str, requested: f64, shown: String, limit: Option<f64>, used: f64| {
        let Some(limit) = limit else {
            return;
        };
        let free = limit - used;
        if requested > free {
            reasons.push(format!(
                "Free {kind} {free:.2} {unit} < requested {shown} {unit}"
            ));
        }
    };

    check(
        "memory",
        "MB",
        delta.memory_mb as f64,
        delta.memory_mb.to_string(),
        limits.memory.map(|m| m as f64),
        node.mem_used as f64,
    );
    check(
        "vcpu",
        "VCPU",
        delta.vcpus,
        delta.vcpus.to_string(),
        limits.cpu,
        node.cpu_used,
    );
    check(
        "disk",
        "GB",
        delta.disk_gb as f64,
        delta.disk_gb.to_string(),
        limits.disk.map(|d| d as f64),
        node.disk_used as f64,
    );

    if !delta.pci_requests.is_empty()
        && !pci_stats.is_some_and(|stats| stats.support_requests(&delta.pci_requests))
    {
        reasons.push("Claim pci failed".to_string());
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(ComputeError::ResourcesUnavailable {
            reason: reasons.join("; "),
        })
    }
}

// ── Claims ────────────────────────────────────────────────────────

/// Resources consumed for a new container.
pub struct Claim {
    tracker: Arc<ComputeNodeTracker>,
    container: Container,
    delta: ResourceDelta,
    resolved: bool,
}

impl Claim {
    pub(crate) fn new(
        tracker: Arc<ComputeNodeTracker>,
        container: Container,
        delta: ResourceDelta,
    ) -> Self {
        Self {
            tracker,
            container,
            delta,
            resolved: false,
        }
    }

    /// The container as claimed, with host and cpuset filled in.
    pub fn container(&self) -> &Container {
        &self.container
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.resolved {
            error!(container = %self.container.uuid, host = %self.tracker.hostname(), "claim dropped without commit or abort");
        }
    }
}

/// Resources consumed for resizing an existing container.
pub struct UpdateClaim {
    tracker: Arc<ComputeNodeTracker>,
    new: Container,
    old: Container,
    delta: ResourceDelta,
    resolved: bool,
}

impl UpdateClaim {
    pub(crate) fn new(
        tracker: Arc<ComputeNodeTracker>,
        new: Container,
        old: Container,
        delta: ResourceDelta,
    ) -> Self {
        Self {
            tracker,
            new,
            old,
            delta,
            resolved: false,
        }
    }
}

impl Drop for UpdateClaim {
    fn drop(&mut self) {
        if !self.resolved {
            error!(container = %self.new.uuid, host = %self.tracker.hostname(), "update claim dropped without commit or abort");
        }
    }
}

/// Outcome of `container_claim` / `container_update_claim`.
pub enum ResourceClaim {
    /// Tracking is disabled, the node is not initialized, or nothing changed.
    Nop,
    Create(Claim),
    Update(UpdateClaim),
}

impl ResourceClaim {
    pub fn is_nop(&self) -> bool {
        matches!(self, ResourceClaim::Nop)
    }

    fn delta(&self) -> Option<&ResourceDelta> {
        match self {
            ResourceClaim::Nop => None,
            ResourceClaim::Create(c) => Some(&c.delta),
            ResourceClaim::Update(u) => Some(&u.delta),
        }
    }

    pub fn memory_mb(&self) -> i64 {
        self.delta().map_or(0, |d| d.memory_mb)
    }

    pub fn vcpus(&self) -> f64 {
        self.delta().map_or(0.0, |d| d.vcpus)
    }

    pub fn disk_gb(&self) -> i64 {
        self.delta().map_or(0, |d| d.disk_gb)
    }

    /// Keep the resources consumed.
    pub fn commit(self) {
        match self {
            ResourceClaim::Nop => {}
            ResourceClaim::Create(mut c) => {
                c.resolved = true;
                debug!(container = %c.container.uuid, "claim committed");
            }
            ResourceClaim::Update(mut u) => {
                u.resolved = true;
                debug!(container = %u.new.uuid, "update claim committed");
            }
        }
    }

    /// Give the resources back.
    pub async fn abort(self) -> ComputeResult<()> {
        match self {
            ResourceClaim::Nop => Ok(()),
            ResourceClaim::Create(mut c) => {
                c.resolved = true;
                c.tracker.abort_container_claim(&c.container).await
            }
            ResourceClaim::Update(mut u) => {
                u.resolved = true;
                u.tracker.abort_container_update_claim(&u.new, &u.old).await
            }
        }
    }

    /// Run `dispatch`, committing on `Ok` and aborting on `Err`.
    pub async fn scope<T, E, F>(self, dispatch: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        match dispatch.await {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = self.abort().await {
                    error!(error = %abort_err, "failed to abort claim after dispatch failure");
                }
                Err(e)
            }
        }
    }
}
