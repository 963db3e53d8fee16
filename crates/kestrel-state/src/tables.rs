//! redb table definitions.

use redb::TableDefinition;

/// Compute node records keyed by `{uuid}`.
pub const COMPUTE_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("compute_nodes");

/// PCI function rows keyed by `{compute_node_uuid}/{address}`.
pub const PCI_DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("pci_devices");

/// Service heartbeat rows keyed by `{host}/{binary}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Container placement records keyed by `{uuid}`.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");
