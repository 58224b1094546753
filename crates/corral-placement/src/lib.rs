//! corral-placement — decides which cores and ports a batch of containers
//! gets.
//!
//! # Components
//!
//! - **`capacity`**: capacity and quota arithmetic over a pod snapshot
//! - **`allocator`**: first-fit reservation across a group's hosts

pub mod allocator;
pub mod capacity;

pub use allocator::{AllocationPlan, Allocator, PlanEntry, Slot};
pub use capacity::{
    containers_fitting, eligible_hosts, has_room, host_fit, max_containers, quota_remaining,
    visiting_order,
};
