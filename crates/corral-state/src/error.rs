//! Error types for the Corral state store.

use thiserror::Error;

use crate::types::{ContainerState, GroupId, HostId};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("host {host_id} is already assigned to group {group_id}")]
    AlreadyAssigned { host_id: HostId, group_id: GroupId },

    #[error("insufficient capacity: requested {requested} containers, {available} available")]
    InsufficientCapacity { requested: u32, available: u32 },

    #[error("port range exhausted: requested {requested} ports, {available} available")]
    PortExhausted { requested: u32, available: u32 },

    #[error("host {host_id} has no core labelled {label:?}")]
    UnknownCore { host_id: HostId, label: String },

    #[error("host {host_id} has no port {port}")]
    UnknownPort { host_id: HostId, port: u16 },

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("pod {0} still has hosts")]
    PodInUse(String),

    #[error("invalid container transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ContainerState,
        to: ContainerState,
    },
}
