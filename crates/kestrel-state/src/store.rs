//! StateStore — redb-backed persistence.
//!
//! Typed CRUD over compute nodes, PCI device rows, service heartbeats and
//! container placements. Supports on-disk and in-memory backends (the
//! latter for tests).

use std::path::Path;
use std::sync::Arc;

use kestrel_core::Container;
use kestrel_pci::PciDevice;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone, Debug)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [COMPUTE_NODES, PCI_DEVICES, SERVICES, CONTAINERS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ────────────────────────────────────────

    fn put_rows<'a, T, I>(&self, table: Table, rows: I) -> StateResult<()>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (String, &'a T)>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            for (key, row) in rows {
                let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
                t.insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Rows whose key starts with `prefix` and that pass `keep`.
    fn scan_rows<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
        keep: impl Fn(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                continue;
            }
            let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&row) {
                results.push(row);
            }
        }
        Ok(results)
    }

    /// Delete `keys`; returns how many existed.
    fn delete_rows<'a>(
        &self,
        table: Table,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            for key in keys {
                if t.remove(key).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Compute nodes ─────────────────────────────────────────────

    pub fn put_compute_node(&self, node: &ComputeNode) -> StateResult<()> {
        self.put_rows(COMPUTE_NODES, [(node.table_key(), node)])?;
        debug!(uuid = %node.uuid, host = %node.hostname, "compute node stored");
        Ok(())
    }

    pub fn get_compute_node(&self, uuid: Uuid) -> StateResult<Option<ComputeNode>> {
        self.get_row(COMPUTE_NODES, &uuid.to_string())
    }

    pub fn get_compute_node_by_hostname(&self, hostname: &str) -> StateResult<Option<ComputeNode>> {
        Ok(self
            .scan_rows::<ComputeNode>(COMPUTE_NODES, "", |n| n.hostname == hostname)?
            .into_iter()
            .next())
    }

    pub fn list_compute_nodes(&self) -> StateResult<Vec<ComputeNode>> {
        self.scan_rows(COMPUTE_NODES, "", |_| true)
    }

    /// Write `node` only if it differs from the stored row.
    ///
    /// Returns the changed field names; empty means nothing was written.
    /// A node with no stored row is always written.
    pub fn update_compute_node(&self, node: &ComputeNode) -> StateResult<Vec<&'static str>> {
        let changed = match self.get_compute_node(node.uuid)? {
            Some(stored) => node.changed_fields(&stored),
            None => node.changed_fields(&ComputeNode::default()),
        };
        if !changed.is_empty() {
            self.put_compute_node(node)?;
        }
        Ok(changed)
    }

    pub fn delete_compute_node(&self, uuid: Uuid) -> StateResult<bool> {
        Ok(self.delete_rows(COMPUTE_NODES, [uuid.to_string().as_str()])? > 0)
    }

    // ── PCI devices ───────────────────────────────────────────────

    /// Upsert device rows in one transaction.
    pub fn put_pci_devices(&self, devices: &[PciDevice]) -> StateResult<()> {
        self.put_rows(PCI_DEVICES, devices.iter().map(|d| (d.table_key(), d)))?;
        debug!(count = devices.len(), "PCI devices stored");
        Ok(())
    }

    pub fn get_pci_device(&self, node: Uuid, address: &str) -> StateResult<Option<PciDevice>> {
        self.get_row(PCI_DEVICES, &format!("{node}/{address}"))
    }

    pub fn list_pci_devices_by_node(&self, node: Uuid) -> StateResult<Vec<PciDevice>> {
        self.scan_rows(PCI_DEVICES, &format!("{node}/"), |_| true)
    }

    /// Delete device rows of `node`; returns how many existed.
    pub fn delete_pci_devices(&self, node: Uuid, addresses: &[String]) -> StateResult<u32> {
        let keys: Vec<String> = addresses.iter().map(|a| format!("{node}/{a}")).collect();
        self.delete_rows(PCI_DEVICES, keys.iter().map(String::as_str))
    }

    // ── Services ──────────────────────────────────────────────────

    pub fn put_service(&self, service: &ServiceRecord) -> StateResult<()> {
        self.put_rows(SERVICES, [(service.table_key(), service)])
    }

    pub fn get_service(&self, host: &str, binary: &str) -> StateResult<Option<ServiceRecord>> {
        self.get_row(SERVICES, &service_key(host, binary))
    }

    pub fn list_services_by_binary(&self, binary: &str) -> StateResult<Vec<ServiceRecord>> {
        self.scan_rows::<ServiceRecord>(SERVICES, "", |s| s.binary == binary)
    }

    /// Record a heartbeat at `now`.
    pub fn touch_service(&self, host: &str, binary: &str, now: u64) -> StateResult<ServiceRecord> {
        let mut service = self
            .get_service(host, binary)?
            .ok_or_else(|| StateError::NotFound(service_key(host, binary)))?;
        service.last_seen_up = Some(now);
        self.put_service(&service)?;
        Ok(service)
    }

    // ── Containers ────────────────────────────────────────────────

    pub fn put_container(&self, container: &Container) -> StateResult<()> {
        self.put_rows(CONTAINERS, [(container.uuid.to_string(), container)])
    }

    pub fn get_container(&self, uuid: Uuid) -> StateResult<Option<Container>> {
        self.get_row(CONTAINERS, &uuid.to_string())
    }

    pub fn list_containers_by_host(&self, host: &str) -> StateResult<Vec<Container>> {
        self.scan_rows::<Container>(CONTAINERS, "", |c| c.host.as_deref() == Some(host))
    }

    pub fn delete_container(&self, uuid: Uuid) -> StateResult<bool> {
        Ok(self.delete_rows(CONTAINERS, [uuid.to_string().as_str()])? > 0)
    }
}
