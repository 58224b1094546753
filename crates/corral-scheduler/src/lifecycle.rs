//! Container lifecycle manager.
//!
//! `Requested -> Reserved -> Running -> Dead`, with `Dead` also reachable
//! from `Reserved`. Along with the allocator this is the only code that
//! changes core and port occupancy.

use corral_state::{Container, NewContainer, StateError, StateStore};
use tracing::{debug, info};

use crate::error::SchedulerResult;

/// A container the runtime has created, ready to take its reserved cores.
pub type ContainerRequest = NewContainer;

#[derive(Clone)]
pub struct Lifecycle {
    store: StateStore,
}

impl Lifecycle {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Commit a reservation to a container. The container starts `Reserved`.
    pub fn create(&self, request: &ContainerRequest) -> SchedulerResult<Container> {
        Ok(self.store.commit_container(request)?)
    }

    pub fn mark_running(&self, id: &str) -> SchedulerResult<Container> {
        let container = self.store.mark_running(id)?;
        debug!(container = %id, "container running");
        Ok(container)
    }

    /// Kill a container and free its cores and port. Deleting a dead
    /// container is a no-op.
    pub fn delete(&self, id: &str) -> SchedulerResult<Container> {
        let container = self.store.kill_container(id)?;
        info!(container = %id, host_id = container.host_id, "container deleted");
        Ok(container)
    }

    pub fn get(&self, id: &str) -> SchedulerResult<Container> {
        self.store
            .get_container(id)?
            .ok_or_else(|| StateError::NotFound(format!("container {id}")).into())
    }
}
