//! ComputeNodeTracker — the resource ledger of one compute host.
//!
//! All ledger mutations (usage counters, NUMA pinning, PCI transitions)
//! happen behind one `tokio::sync::Mutex`, so concurrent claims against the
//! host serialize. Every successful mutation is persisted before the lock
//! is released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kestrel_core::{
    Container, ContainerCpuset, ContainerStatus, Limits, NumaError, PciRequest, epoch_millis,
};
use kestrel_pci::{PciDevTracker, PciWhitelist};
use kestrel_state::{ComputeNode, StateStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::claims::{Claim, ResourceClaim, ResourceDelta, UpdateClaim, claim_test};
use crate::error::{ComputeError, ComputeResult};
use crate::probe::ResourceProbe;

/// Mutable state guarded by the tracker's lock.
#[derive(Default, Clone)]
struct NodeLedger {
    compute_node: Option<ComputeNode>,
    /// Containers whose usage is counted, by uuid.
    tracked: HashMap<Uuid, Container>,
    pci: Option<PciDevTracker>,
}

pub struct ComputeNodeTracker {
    hostname: String,
    store: StateStore,
    probe: Arc<dyn ResourceProbe>,
    whitelist: Arc<PciWhitelist>,
    tracking_enabled: bool,
    ledger: Mutex<NodeLedger>,
}

impl ComputeNodeTracker {
    pub fn new(
        hostname: impl Into<String>,
        store: StateStore,
        probe: Arc<dyn ResourceProbe>,
        whitelist: Arc<PciWhitelist>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            store,
            probe,
            whitelist,
            tracking_enabled: true,
            ledger: Mutex::new(NodeLedger::default()),
        }
    }

    /// With tracking disabled every claim is a `Nop`.
    pub fn with_tracking(mut self, enabled: bool) -> Self {
        self.tracking_enabled = enabled;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Snapshot of the in-memory compute node.
    pub async fn compute_node(&self) -> Option<ComputeNode> {
        self.ledger.lock().await.compute_node.clone()
    }

    /// Containers currently counted against the host.
    pub async fn tracked_containers(&self) -> Vec<Uuid> {
        self.ledger.lock().await.tracked.keys().copied().collect()
    }

    // ── Claims ────────────────────────────────────────────────────

    /// Test `container` against the host and consume it.
    ///
    /// On success `container` carries the host and, for dedicated
    /// containers, the pinned cpuset. On failure the ledger and
    /// `container` are left as they were.
    pub async fn container_claim(
        self: &Arc<Self>,
        container: &mut Container,
        pci_requests: &[PciRequest],
        limits: &Limits,
    ) -> ComputeResult<ResourceClaim> {
        if !self.tracking_enabled {
            return Ok(ResourceClaim::Nop);
        }

        let mut guard = self.ledger.lock().await;
        if guard.compute_node.is_none() {
            debug!(host = %self.hostname, container = %container.uuid, "node not initialized, skipping claim");
            return Ok(ResourceClaim::Nop);
        }

        let delta = ResourceDelta::for_container(container, pci_requests);
        let placement = (container.host.clone(), container.cpuset.clone());
        if let Err(e) = transact(&mut guard, |ledger| {
            self.claim_locked(ledger, container, pci_requests, &delta, limits)
        }) {
            (container.host, container.cpuset) = placement;
            return Err(e);
        }

        debug!(
            host = %self.hostname,
            container = %container.uuid,
            memory_mb = delta.memory_mb,
            vcpus = delta.vcpus,
            disk_gb = delta.disk_gb,
            ?limits,
            "claim accepted"
        );
        Ok(ResourceClaim::Create(Claim::new(
            self.clone(),
            container.clone(),
            delta,
        )))
    }

    fn claim_locked(
        &self,
        ledger: &mut NodeLedger,
        container: &mut Container,
        pci_requests: &[PciRequest],
        delta: &ResourceDelta,
        limits: &Limits,
    ) -> ComputeResult<()> {
        let node = ledger
            .compute_node
            .as_mut()
            .ok_or_else(|| ComputeError::NodeNotInitialized(self.hostname.clone()))?;
        if let Err(e) = claim_test(delta, node, ledger.pci.as_ref().map(|p| p.stats()), limits) {
            warn!(host = %self.hostname, container = %container.uuid, error = %e, "claim rejected");
            return Err(e);
        }

        let cpuset = if container.is_dedicated() {
            Some(pick_cpuset(node, container, limits)?)
        } else {
            None
        };

        if !pci_requests.is_empty() {
            let pci = ledger
                .pci
                .as_mut()
                .ok_or_else(|| ComputeError::NodeNotInitialized(self.hostname.clone()))?;
            pci.claim_container(container.uuid, pci_requests)?;
        }

        container.host = Some(self.hostname.clone());
        container.cpuset = cpuset;
        consume(node, container, 1)?;
        node.updated_at = Some(epoch_millis());
        ledger.tracked.insert(container.uuid, container.clone());

        self.persist(ledger)?;
        self.store.put_container(container)?;
        Ok(())
    }

    /// Test and consume only the difference between `old` and `new`.
    ///
    /// Equal resource shapes return `Nop` without touching the ledger.
    pub async fn container_update_claim(
        self: &Arc<Self>,
        new: &mut Container,
        old: &Container,
        limits: &Limits,
    ) -> ComputeResult<ResourceClaim> {
        if !self.tracking_enabled || new.same_resources_as(old) {
            return Ok(ResourceClaim::Nop);
        }

        let mut guard = self.ledger.lock().await;
        if guard.compute_node.is_none() {
            return Ok(ResourceClaim::Nop);
        }

        let delta = ResourceDelta::between(new, old);
        let placement = (new.host.clone(), new.cpuset.clone());
        let result = transact(&mut guard, |ledger| {
            let node = ledger
                .compute_node
                .as_mut()
                .ok_or_else(|| ComputeError::NodeNotInitialized(self.hostname.clone()))?;
            if let Err(e) = claim_test(&delta, node, None, limits) {
                warn!(host = %self.hostname, container = %new.uuid, error = %e, "update claim rejected");
                return Err(e);
            }

            new.host = Some(self.hostname.clone());
            new.cpuset = old.cpuset.clone();
            apply_usage(node, delta.memory_mb, delta.vcpus, delta.disk_gb);
            node.updated_at = Some(epoch_millis());
            ledger.tracked.insert(new.uuid, new.clone());

            self.persist(ledger)?;
            self.store.put_container(new)?;
            Ok(())
        });
        if let Err(e) = result {
            (new.host, new.cpuset) = placement;
            return Err(e);
        }

        debug!(host = %self.hostname, container = %new.uuid, memory_mb = delta.memory_mb, vcpus = delta.vcpus, disk_gb = delta.disk_gb, "update claim accepted");
        Ok(ResourceClaim::Update(UpdateClaim::new(
            self.clone(),
            new.clone(),
            old.clone(),
            delta,
        )))
    }

    /// Undo a `container_claim`. The node's `updated_at` is left alone.
    pub async fn abort_container_claim(&self, container: &Container) -> ComputeResult<()> {
        let released = self.release(container, false).await?;
        if released {
            let mut unplaced = container.clone();
            unplaced.host = None;
            unplaced.cpuset = None;
            self.store.put_container(&unplaced)?;
            info!(host = %self.hostname, container = %container.uuid, "claim aborted");
        }
        Ok(())
    }

    /// Undo a `container_update_claim`. The node's `updated_at` is left alone.
    pub async fn abort_container_update_claim(
        &self,
        new: &Container,
        old: &Container,
    ) -> ComputeResult<()> {
        let mut guard = self.ledger.lock().await;
        transact(&mut guard, |ledger| {
            let Some(node) = ledger.compute_node.as_mut() else {
                return Ok(());
            };
            if ledger.tracked.remove(&new.uuid).is_none() {
                return Ok(());
            }

            let delta = ResourceDelta::between(new, old);
            apply_usage(node, -delta.memory_mb, -delta.vcpus, -delta.disk_gb);
            ledger.tracked.insert(old.uuid, old.clone());

            self.persist(ledger)?;
            self.store.put_container(old)?;
            info!(host = %self.hostname, container = %new.uuid, "update claim aborted");
            Ok(())
        })
    }

    /// Release a deleted container's resources.
    pub async fn remove_usage_from_container(&self, container: &Container) -> ComputeResult<()> {
        if self.release(container, true).await? {
            self.store.delete_container(container.uuid)?;
            debug!(host = %self.hostname, container = %container.uuid, "usage removed");
        }
        Ok(())
    }

    /// Give back everything `container` holds. Returns false if it was not
    /// tracked.
    async fn release(&self, container: &Container, touch: bool) -> ComputeResult<bool> {
        let mut guard = self.ledger.lock().await;
        transact(&mut guard, |ledger| {
            let Some(node) = ledger.compute_node.as_mut() else {
                return Ok(false);
            };
            let Some(tracked) = ledger.tracked.remove(&container.uuid) else {
                return Ok(false);
            };

            consume(node, &tracked, -1)?;
            if touch {
                node.updated_at = Some(epoch_millis());
            }
            if let Some(pci) = ledger.pci.as_mut() {
                pci.free_container(tracked.uuid)?;
            }
            self.persist(ledger)?;
            Ok(true)
        })
    }

    // ── Audit ─────────────────────────────────────────────────────

    /// Re-probe the host and rebuild usage from the containers placed on it.
    ///
    /// A failed audit leaves the ledger as it was.
    pub async fn update_available_resource(&self) -> ComputeResult<()> {
        let mut guard = self.ledger.lock().await;
        transact(&mut guard, |ledger| self.audit_locked(ledger))?;

        if let Some(node) = &guard.compute_node {
            info!(
                host = %self.hostname,
                containers = node.total_containers,
                mem_used = node.mem_used,
                cpu_used = node.cpu_used,
                disk_used = node.disk_used,
                "resource audit complete"
            );
        }
        Ok(())
    }

    fn audit_locked(&self, ledger: &mut NodeLedger) -> ComputeResult<()> {
        let now = epoch_millis();

        let mut node = match ledger.compute_node.clone() {
            Some(node) => node,
            None => match self.store.get_compute_node_by_hostname(&self.hostname)? {
                Some(node) => node,
                None => {
                    info!(host = %self.hostname, "registering compute node");
                    ComputeNode::new(Uuid::new_v4(), self.hostname.clone(), now)
                }
            },
        };
        self.probe
            .get_available_resources(&mut node)
            .map_err(ComputeError::Probe)?;
        let probed = self
            .probe
            .pci_passthrough_devices()
            .map_err(ComputeError::Probe)?;

        let mut pci = match ledger.pci.take() {
            Some(pci) => pci,
            None => {
                let rows = self.store.list_pci_devices_by_node(node.uuid)?;
                PciDevTracker::new(node.uuid, self.whitelist.clone(), rows)
            }
        };
        pci.update_devices_from_probe(&probed)?;

        node.mem_used = 0;
        node.cpu_used = 0.0;
        node.disk_used = 0;
        node.total_containers = 0;
        node.mem_free = node.mem_total;
        node.mem_available = node.mem_total;
        node.numa_topology.reset_usage();

        let containers: Vec<Container> = self
            .store
            .list_containers_by_host(&self.hostname)?
            .into_iter()
            .filter(|c| c.status != ContainerStatus::Deleted)
            .collect();

        let mut tracked = HashMap::with_capacity(containers.len());
        for container in containers {
            if let Err(e) = consume(&mut node, &container, 1) {
                warn!(host = %self.hostname, container = %container.uuid, error = %e, "container usage does not fit, counting without cpuset");
                let mut unpinned = container.clone();
                unpinned.cpuset = None;
                consume(&mut node, &unpinned, 1)?;
            }
            if matches!(
                container.status,
                ContainerStatus::Created | ContainerStatus::Running | ContainerStatus::Stopped
            ) {
                pci.update_pci_for_container(&container, 1)?;
            }
            tracked.insert(container.uuid, container);
        }

        let live: HashSet<Uuid> = tracked.keys().copied().collect();
        pci.clean_usage(&live)?;

        node.updated_at = Some(now);
        ledger.compute_node = Some(node);
        ledger.tracked = tracked;
        ledger.pci = Some(pci);
        self.persist(ledger)
    }

    /// Write the node record and changed PCI rows.
    fn persist(&self, ledger: &mut NodeLedger) -> ComputeResult<()> {
        let Some(node) = ledger.compute_node.as_mut() else {
            return Err(ComputeError::NodeNotInitialized(self.hostname.clone()));
        };
        if let Some(pci) = ledger.pci.as_mut() {
            node.pci_device_pools = pci.pools();
            let dirty = pci.take_dirty();
            if !dirty.upserts.is_empty() {
                self.store.put_pci_devices(&dirty.upserts)?;
            }
            if !dirty.removed.is_empty() {
                self.store.delete_pci_devices(node.uuid, &dirty.removed)?;
                pci.finish_removal(&dirty.removed)?;
            }
        }
        let changed = self.store.update_compute_node(node)?;
        if !changed.is_empty() {
            debug!(host = %self.hostname, ?changed, "compute node updated");
        }
        Ok(())
    }
}

/// Run `f` against the ledger, putting the ledger back as it was if `f`
/// fails part way.
fn transact<T>(
    ledger: &mut NodeLedger,
    f: impl FnOnce(&mut NodeLedger) -> ComputeResult<T>,
) -> ComputeResult<T> {
    let saved = ledger.clone();
    let result = f(ledger);
    if result.is_err() {
        *ledger = saved;
    }
    result
}

/// Choose CPUs for a dedicated container: the node the scheduler picked,
/// else the first node that fits.
fn pick_cpuset(
    node: &ComputeNode,
    container: &Container,
    limits: &Limits,
) -> ComputeResult<ContainerCpuset> {
    let count = container.dedicated_cpu_count();
    let memory = container.memory_mb();
    let topology = &node.numa_topology;

    let numa = match &limits.cpuset {
        Some(chosen) => topology
            .node(chosen.node)
            .ok_or(NumaError::NodeNotFound(chosen.node))?,
        None => topology.first_fit(count, memory).ok_or_else(|| {
            ComputeError::ResourcesUnavailable {
                reason: format!("No NUMA node fits {count} dedicated CPUs and {memory} MB"),
            }
        })?,
    };

    let free = numa.free_cpus();
    if free.len() < count || numa.mem_available < memory {
        return Err(ComputeError::ResourcesUnavailable {
            reason: format!(
                "NUMA node {} has {} free CPUs and {} MB, requested {count} CPUs and {memory} MB",
                numa.id,
                free.len(),
                numa.mem_available
            ),
        });
    }

    Ok(ContainerCpuset {
        node: numa.id,
        cpus: free.into_iter().take(count).collect(),
    })
}

/// Add (`sign > 0`) or remove a container's usage, including its pinned CPUs.
///
/// Pinning is validated before any counter moves.
fn consume(node: &mut ComputeNode, container: &Container, sign: i8) -> ComputeResult<()> {
    if let Some(cpuset) = &container.cpuset {
        let numa = node.numa_topology.node_mut(cpuset.node)?;
        if sign > 0 {
            numa.pin_cpus(&cpuset.cpus)?;
        } else {
            numa.unpin_cpus(&cpuset.cpus)?;
        }
        numa.adjust_memory(container.memory_mb(), sign);
    }

    let factor = i64::from(sign.signum());
    apply_usage(
        node,
        factor * container.memory_mb() as i64,
        f64::from(factor as i32) * container.vcpus(),
        factor * container.disk_gb() as i64,
    );
    if sign > 0 {
        node.total_containers += 1;
    } else {
        node.total_containers = node.total_containers.saturating_sub(1);
    }
    Ok(())
}

fn apply_usage(node: &mut ComputeNode, memory_mb: i64, vcpus: f64, disk_gb: i64) {
    node.mem_used = (node.mem_used as i64 + memory_mb).max(0) as u64;
    node.cpu_used = (node.cpu_used + vcpus).max(0.0);
    node.disk_used = (node.disk_used as i64 + disk_gb).max(0) as u64;
    node.mem_free = node.mem_total.saturating_sub(node.mem_used);
    node.mem_available = node.mem_free;
}
