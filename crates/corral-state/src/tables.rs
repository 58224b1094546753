//! redb table definitions for the Corral state store.
//!
//! Records are JSON-serialized into `&[u8]` values. Numeric ids are `u64`
//! keys so table iteration yields records in ascending id order, which is
//! the host visitation order the allocator relies on.

use redb::TableDefinition;

/// Id counters keyed by record kind.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Unique name index keyed by `{kind}/{name}`.
pub const NAMES: TableDefinition<&str, u64> = TableDefinition::new("names");

pub const PODS: TableDefinition<u64, &[u8]> = TableDefinition::new("pods");

pub const GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("groups");

/// Public pool authorizations keyed by `{group_id}:{pod_id}`.
pub const GROUP_PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_pods");

pub const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");

/// Core and port occupancy keyed by host id.
pub const INVENTORIES: TableDefinition<u64, &[u8]> = TableDefinition::new("inventories");

pub const RESERVATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("reservations");

pub const APPS: TableDefinition<u64, &[u8]> = TableDefinition::new("apps");

pub const VERSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("versions");

/// Containers keyed by runtime-assigned id.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");
