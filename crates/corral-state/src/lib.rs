//! corral-state — metadata store and core/port inventory for Corral.
//!
//! Backed by [redb](https://docs.rs/redb). Holds pods, groups, hosts and
//! their inventories, apps, versions, containers, tasks and reservations.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Id-keyed tables use `u64` keys so iteration is in ascending id order.
//!
//! Every mutation of core/port occupancy happens inside a single redb write
//! transaction. redb serializes writers, so "read free cores, select, mark"
//! can never interleave with another writer on the same host.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod containers;
pub mod error;
pub mod inventory;
pub mod store;
pub mod tables;
pub mod types;

pub use containers::NewContainer;
pub use error::{StateError, StateResult};
pub use inventory::{HostGrant, HostStep, NewHost};
pub use store::StateStore;
pub use types::*;
