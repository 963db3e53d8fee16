//! Scheduler drivers.
//!
//! `select_destinations` places a batch of containers, one destination
//! each, or fails the whole batch with `NoValidHost`.
//!
//! Every container in a batch is filtered against the same host snapshot
//! taken before the batch. Consumption is applied to the host cache only
//! once the whole batch has been placed, so two containers of one batch
//! may land on a host that can only hold one of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{Container, Destination, ExtraSpec, KestrelConfig, Limits};
use kestrel_pci::PciAliases;
use kestrel_state::{COMPUTE_BINARY, ServiceRecord, StateStore};
use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::filters::{FilterContext, HostFilter, build_filters, get_filtered_hosts};
use crate::host_manager::HostManager;
use crate::host_state::HostState;
use crate::servicegroup::ServiceGroup;

/// Extra-spec hint carrying a PCI alias expression (`"nic:2,gpu"`).
pub const PCI_ALIAS_HINT: &str = "pci_alias";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Filter pipeline, then a random survivor.
    Filter,
    /// A random host with an enabled, live compute service.
    Chance,
}

impl DriverKind {
    pub fn from_name(name: &str) -> SchedulerResult<Self> {
        match name {
            "filter_scheduler" => Ok(DriverKind::Filter),
            "chance_scheduler" => Ok(DriverKind::Chance),
            other => Err(SchedulerError::UnknownDriver(other.to_string())),
        }
    }
}

pub struct SchedulerDriver {
    kind: DriverKind,
    store: StateStore,
    host_manager: HostManager,
    servicegroup: ServiceGroup,
    filters: Vec<Arc<dyn HostFilter>>,
    aliases: PciAliases,
}

impl SchedulerDriver {
    /// Build the configured driver. Unknown driver or filter names and bad
    /// PCI aliases are rejected here.
    pub fn from_config(config: &KestrelConfig, store: StateStore) -> SchedulerResult<Self> {
        let kind = DriverKind::from_name(&config.scheduler.driver)?;
        let servicegroup =
            ServiceGroup::new(Duration::from_secs(config.compute.service_down_time_secs));
        let ctx = FilterContext {
            default_availability_zone: config.compute.default_availability_zone.clone(),
            servicegroup,
        };
        let filters = match kind {
            DriverKind::Filter => build_filters(&config.scheduler.enabled_filters, &ctx)?,
            DriverKind::Chance => Vec::new(),
        };
        let aliases = PciAliases::from_config(&config.pci.alias)?;

        info!(
            driver = ?kind,
            filters = ?filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            "scheduler driver built"
        );
        Ok(Self {
            kind,
            store,
            host_manager: HostManager::new(),
            servicegroup,
            filters,
            aliases,
        })
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    /// Pick one destination per container.
    ///
    /// With `candidates`, the first listed host that survives filtering is
    /// preferred over a random pick. Malformed `resources[N]:`/`trait[N]:`
    /// keys fail the request before any host is looked at.
    pub async fn select_destinations(
        &self,
        containers: &[Container],
        extra_spec: &ExtraSpec,
        candidates: Option<&[String]>,
    ) -> SchedulerResult<Vec<Destination>> {
        let groups = extra_spec.request_groups()?;
        debug!(
            containers = containers.len(),
            request_groups = groups.len(),
            reservation = extra_spec.reservation(),
            "scheduling request"
        );

        let containers = containers
            .iter()
            .map(|c| self.expand_pci_aliases(c, extra_spec))
            .collect::<SchedulerResult<Vec<_>>>()?;

        let destinations = match self.kind {
            DriverKind::Filter => {
                self.filter_schedule(&containers, extra_spec, candidates)
                    .await?
            }
            DriverKind::Chance => self.chance_schedule(&containers)?,
        };
        if destinations.is_empty() {
            return Err(no_valid_host("No containers to schedule."));
        }
        Ok(destinations)
    }

    async fn filter_schedule(
        &self,
        containers: &[Container],
        extra_spec: &ExtraSpec,
        candidates: Option<&[String]>,
    ) -> SchedulerResult<Vec<Destination>> {
        let services = self.services_by_host()?;
        if services.is_empty() {
            return Err(no_valid_host("No compute service is up."));
        }
        let nodes: Vec<_> = self
            .store
            .list_compute_nodes()?
            .into_iter()
            .filter(|n| services.contains_key(&n.hostname))
            .collect();
        let snapshot = self.host_manager.get_all_host_state(&nodes, &services).await;

        let mut chosen = Vec::with_capacity(containers.len());
        for container in containers {
            let hosts = get_filtered_hosts(&self.filters, snapshot.clone(), container, extra_spec);
            let host = pick_host(hosts, candidates).ok_or_else(|| {
                no_valid_host("There are not enough hosts available.")
            })?;
            info!(container = %container.uuid, host = %host.hostname, "host selected");
            chosen.push(host);
        }

        let mut destinations = Vec::with_capacity(chosen.len());
        for (container, host) in containers.iter().zip(chosen) {
            self.host_manager.consume_from_request(&host, container).await;
            destinations.push(Destination {
                host: host.hostname,
                nodename: host.nodename,
                limits: host.limits,
            });
        }
        Ok(destinations)
    }

    fn chance_schedule(&self, containers: &[Container]) -> SchedulerResult<Vec<Destination>> {
        let hosts: Vec<String> = self
            .services_by_host()?
            .into_values()
            .filter(|s| !s.disabled)
            .map(|s| s.host)
            .collect();
        if hosts.is_empty() {
            return Err(no_valid_host("No compute service is up."));
        }

        let mut rng = rand::rng();
        let mut destinations = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(host) = hosts.choose(&mut rng) else {
                return Err(no_valid_host("There are not enough hosts available."));
            };
            info!(container = %container.uuid, host = %host, "host selected");
            destinations.push(Destination {
                host: host.clone(),
                nodename: None,
                limits: Limits::default(),
            });
        }
        Ok(destinations)
    }

    /// Compute services that are up, by host. Disabled services are kept
    /// for the compute filter to reject.
    fn services_by_host(&self) -> SchedulerResult<HashMap<String, ServiceRecord>> {
        let services: HashMap<_, _> = self
            .store
            .list_services_by_binary(COMPUTE_BINARY)?
            .into_iter()
            .filter(|s| self.servicegroup.service_is_up(s))
            .map(|s| (s.host.clone(), s))
            .collect();
        debug!(up = services.len(), "compute services up");
        Ok(services)
    }

    fn expand_pci_aliases(
        &self,
        container: &Container,
        extra_spec: &ExtraSpec,
    ) -> SchedulerResult<Container> {
        let mut container = container.clone();
        if let Some(expression) = extra_spec.hints.get(PCI_ALIAS_HINT) {
            container
                .pci_requests
                .extend(self.aliases.translate(expression)?);
        }
        Ok(container)
    }
}

/// The first surviving candidate, else a random survivor.
fn pick_host(hosts: Vec<HostState>, candidates: Option<&[String]>) -> Option<HostState> {
    if let Some(candidates) = candidates.filter(|c| !c.is_empty()) {
        return candidates
            .iter()
            .find_map(|name| hosts.iter().find(|h| &h.hostname == name))
            .cloned();
    }
    hosts.choose(&mut rand::rng()).cloned()
}

fn no_valid_host(reason: &str) -> SchedulerError {
    warn!(reason, "no valid host");
    SchedulerError::NoValidHost {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::epoch_millis;
    use kestrel_core::config::PciAliasConfig;
    use kestrel_pci::PciDevicePool;
    use kestrel_state::ComputeNode;
    use std::collections::{BTreeMap, HashSet};
    use uuid::Uuid;

    fn add_host(store: &StateStore, hostname: &str, mem_total: u64) -> ComputeNode {
        let mut node = ComputeNode::new(Uuid::new_v4(), hostname, 0);
        node.mem_total = mem_total;
        node.cpus = 4.0;
        node.disk_total = 100;
        node.runtimes = vec!["runc".to_string()];
        node.updated_at = Some(1);
        store.put_compute_node(&node).unwrap();

        let mut svc = ServiceRecord::new(hostname, COMPUTE_BINARY, epoch_millis());
        svc.last_seen_up = Some(epoch_millis());
        store.put_service(&svc).unwrap();
        node
    }

    fn config(driver: &str) -> KestrelConfig {
        let mut config = KestrelConfig::default();
        config.scheduler.driver = driver.to_string();
        config
    }

    fn container(memory: u64) -> Container {
        let mut c = Container::new(Uuid::new_v4());
        c.memory = Some(memory);
        c.cpu = Some(1.0);
        c
    }

    fn is_no_valid_host(err: &SchedulerError) -> bool {
        matches!(err, SchedulerError::NoValidHost { .. })
    }

    #[tokio::test]
    async fn random_choice_among_survivors() {
        let store = StateStore::open_in_memory().unwrap();
        let names: HashSet<String> = (0..4).map(|i| format!("host-{i}")).collect();
        for name in &names {
            add_host(&store, name, 1 << 20);
        }
        let driver = SchedulerDriver::from_config(&config("filter_scheduler"), store).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let dests = driver
                .select_destinations(&[container(1)], &ExtraSpec::default(), None)
                .await
                .unwrap();
            assert_eq!(dests.len(), 1);
            assert!(names.contains(&dests[0].host));
            assert_eq!(dests[0].limits.memory, Some(1 << 20));
            seen.insert(dests[0].host.clone());
        }
        assert_eq!(seen, names);
    }

    #[tokio::test]
    async fn no_surviving_host_fails() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..4 {
            add_host(&store, &format!("host-{i}"), 1024);
        }
        let driver = SchedulerDriver::from_config(&config("filter_scheduler"), store).unwrap();
        let err = driver
            .select_destinations(&[container(2048)], &ExtraSpec::default(), None)
            .await
            .unwrap_err();
        assert!(is_no_valid_host(&err));
    }

    #[tokio::test]
    async fn no_service_up_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let driver = SchedulerDriver::from_config(&config("filter_scheduler"), store).unwrap();
        let err = driver
            .select_destinations(&[container(1)], &ExtraSpec::default(), None)
            .await
            .unwrap_err();
        assert!(is_no_valid_host(&err));
    }

    #[tokio::test]
    async fn one_unplaceable_container_fails_the_batch() {
        let store = StateStore::open_in_memory().unwrap();
        add_host(&store, "host-1", 4096);
        let driver = SchedulerDriver::from_config(&config("filter_scheduler"), store).unwrap();

        let err = driver
            .select_destinations(&[container(1024), container(8192)], &ExtraSpec::default(), None)
            .await
            .unwrap_err();
        assert!(is_no_valid_host(&err));

        // Nothing was consumed for the first container.
        let dests = driver
            .select_destinations(&[container(4096)], &ExtraSpec::default(), None)
            .await
            .unwrap();
        assert_eq!(dests[0].host, "host-1");
    }

    #[tokio::test]
    async fn batch_sees_static_snapshot_then_consumes() {
        let store = StateStore::open_in_memory().unwrap();
        add_host(&store, "host-1", 4096);
        let driver = SchedulerDriver::from_config(&config("filter_scheduler"), store).unwrap();

        let dests = driver
            .select_destinations(&[container(3000), container(3000)], &ExtraSpec::default(), None)
            .await
            .unwrap();
        assert_eq!(dests.len(), 2);
        assert!(dests.iter().all(|d| d.host == "host-1"));

        // The stored node is older than the consumed cache entry.
        let err = driver
            .select_destinations(&[container(3000)], &ExtraSpec::default(), None)
            .await
            .unwrap_err();
        assert!(is_no_valid_host(&err));
    }

    #[tokio::test]
    async fn candidates_are_preferred_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        add_host(&store, "small", 512);
        add_host(&store, "big-1", 8192);
        add_host(&store, "big-2", 8192);
        let driver = SchedulerDriver::from_config(&config("filter_scheduler"), store).unwrap();

        let candidates = vec!["small".to_string(), "big-2".to_string(), "big-1".to_string()];
        let dests = driver
            .select_destinations(&[container(1024)], &ExtraSpec::default(), Some(&candidates))
            .await
            .unwrap();
        assert_eq!(dests[0].host, "big-2");

        let only_small = vec!["small".to_string()];
        assert!(driver
            .select_destinations(&[container(1024)], &ExtraSpec::default(), Some(&only_small))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn disabled_and_down_hosts_are_skipped() {
        let store = StateStore::open_in_memory().unwrap();
        add_host(&store, "live", 4096);
        add_host(&store, "disabled", 4096);
        add_host(&store, "down", 4096);

        let mut svc = store.get_service("disabled", COMPUTE_BINARY).unwrap().unwrap();
        svc.disabled = true;
        store.put_service(&svc).unwrap();
        let mut svc = store.get_service("down", COMPUTE_BINARY).unwrap().unwrap();
        svc.created_at = 0;
        svc.last_seen_up = Some(0);
        store.put_service(&svc).unwrap();

        for driver_name in ["filter_scheduler", "chance_scheduler"] {
            let driver = SchedulerDriver::from_config(&config(driver_name), store.clone()).unwrap();
            for _ in 0..20 {
                let dests = driver
                    .select_destinations(&[container(1)], &ExtraSpec::default(), None)
                    .await
                    .unwrap();
                assert_eq!(dests[0].host, "live");
            }
        }
    }

    #[tokio::test]
    async fn chance_driver_ignores_resources() {
        let store = StateStore::open_in_memory().unwrap();
        add_host(&store, "tiny", 1);
        let driver = SchedulerDriver::from_config(&config("chance_scheduler"), store).unwrap();
        assert_eq!(driver.kind(), DriverKind::Chance);

        let dests = driver
            .select_destinations(&[container(8192)], &ExtraSpec::default(), None)
            .await
            .unwrap();
        assert_eq!(dests[0].host, "tiny");
        assert_eq!(dests[0].limits, Limits::default());
    }

    #[tokio::test]
    async fn pci_alias_hint_becomes_requests() {
        let store = StateStore::open_in_memory().unwrap();
        add_host(&store, "plain", 4096);
        let mut node = add_host(&store, "with-nic", 4096);
        node.pci_device_pools = vec![PciDevicePool {
            vendor_id: "8086".to_string(),
            product_id: "1520".to_string(),
            numa_node: Some(0),
            tags: BTreeMap::from([("dev_type".to_string(), "type-VF".to_string())]),
            count: 2,
            devices: Vec::new(),
        }];
        store.put_compute_node(&node).unwrap();

        let mut config = config("filter_scheduler");
        config.pci.alias = vec![PciAliasConfig {
            name: "nic".to_string(),
            vendor_id: "8086".to_string(),
            product_id: "1520".to_string(),
            device_type: Some("type-VF".to_string()),
        }];
        let driver = SchedulerDriver::from_config(&config, store).unwrap();

        let mut extra = ExtraSpec::default();
        extra.hints.insert(PCI_ALIAS_HINT.to_string(), "nic:2".to_string());
        let dests = driver
            .select_destinations(&[container(1)], &extra, None)
            .await
            .unwrap();
        assert_eq!(dests[0].host, "with-nic");

        // Both devices were consumed from the cached pool.
        extra.hints.insert(PCI_ALIAS_HINT.to_string(), "nic".to_string());
        let err = driver
            .select_destinations(&[container(1)], &extra, None)
            .await
            .unwrap_err();
        assert!(is_no_valid_host(&err));

        extra.hints.insert(PCI_ALIAS_HINT.to_string(), "gpu".to_string());
        let err = driver
            .select_destinations(&[container(1)], &extra, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Pci(_)));
    }

    #[tokio::test]
    async fn malformed_request_groups_fail_before_placement() {
        let store = StateStore::open_in_memory().unwrap();
        add_host(&store, "host-1", 4096);
        let driver = SchedulerDriver::from_config(&config("filter_scheduler"), store).unwrap();

        let mut extra = ExtraSpec::default();
        extra.extra.insert("resources1:VCPU".to_string(), "2".to_string());
        extra.extra.insert("trait1:HW_NIC_SRIOV".to_string(), "required".to_string());
        extra.hints.insert("reservation".to_string(), "r-1".to_string());
        let dests = driver
            .select_destinations(&[container(512)], &extra, None)
            .await
            .unwrap();
        assert_eq!(dests[0].host, "host-1");

        extra.extra.insert("traitX:HW_AVX".to_string(), "required".to_string());
        let err = driver
            .select_destinations(&[container(512)], &extra, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Spec(_)), "{err}");
    }

    #[test]
    fn unknown_driver_and_filter_fail_at_build() {
        let store = StateStore::open_in_memory().unwrap();
        let err = SchedulerDriver::from_config(&config("best_scheduler"), store.clone())
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::UnknownDriver(_)));

        let mut cfg = config("filter_scheduler");
        cfg.scheduler.enabled_filters.push("GpuFilter".to_string());
        let err = SchedulerDriver::from_config(&cfg, store).err().unwrap();
        assert!(matches!(err, SchedulerError::HostFilterNotFound(_)));
    }
}
