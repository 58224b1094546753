//! corral-scheduler — container lifecycle and placement orchestration.
//!
//! Turns a placement request into running containers:
//!
//! - Validates the request against the version and its owning group
//! - Reserves cores and ports through the allocator
//! - Creates and starts containers through a [`RuntimeGateway`]
//! - Commits each container to its reserved cores via [`Lifecycle`]
//!
//! # Architecture
//!
//! ```text
//! PlacementService
//!   ├── Allocator (corral-placement, reserve/release)
//!   ├── Lifecycle (commit, mark running, delete)
//!   └── RuntimeGateway (create/start/stop/remove on the host daemon)
//! ```

pub mod env;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod placement;

pub use error::{SchedulerError, SchedulerResult};
pub use gateway::{ContainerSpec, DryRunGateway, RuntimeGateway, StartOptions};
pub use lifecycle::{ContainerRequest, Lifecycle};
pub use placement::{PlacedContainer, PlacementRequest, PlacementService};
