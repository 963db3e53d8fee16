//! Host state cache.
//!
//! One `HostState` per `(hostname, nodename)` lives behind its own lock.
//! Snapshots for filtering are cloned out, so filtering never holds a
//! host lock; `consume_from_request` takes it.

use std::collections::{HashMap, HashSet};

use kestrel_core::{Container, KeyedMutex};
use kestrel_state::{ComputeNode, ServiceRecord};
use tracing::debug;

use crate::host_state::HostState;

type HostKey = (String, Option<String>);

#[derive(Default)]
pub struct HostManager {
    states: KeyedMutex<HostKey, HostState>,
}

impl HostManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `nodes` and their services into the cache and return a
    /// snapshot of every host that has a compute node.
    ///
    /// Hosts no longer listed are forgotten.
    pub async fn get_all_host_state(
        &self,
        nodes: &[ComputeNode],
        services: &HashMap<String, ServiceRecord>,
    ) -> Vec<HostState> {
        let mut seen = HashSet::new();
        let mut snapshot = Vec::with_capacity(nodes.len());

        for node in nodes {
            let key = host_key(node);
            let mut state = self
                .states
                .lock_or_insert_with(&key, || HostState::new(key.0.clone(), key.1.clone()))
                .await;
            state.update(Some(node), services.get(&node.hostname));
            state.limits = Default::default();
            snapshot.push(state.clone());
            seen.insert(key);
        }

        self.states.retain(|k| seen.contains(k)).await;
        debug!(hosts = snapshot.len(), "host states refreshed");
        snapshot
    }

    /// Consume `container` on the cached state of `host`.
    pub async fn consume_from_request(&self, host: &HostState, container: &Container) {
        let key = (host.hostname.clone(), host.nodename.clone());
        if let Some(mut state) = self.states.lock(&key).await {
            state.consume_from_request(container);
        }
    }
}

fn host_key(node: &ComputeNode) -> HostKey {
    (node.hostname.clone(), Some(node.uuid.to_string()))
}
