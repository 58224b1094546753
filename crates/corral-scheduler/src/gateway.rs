//! Runtime gateway interface and dry-run implementation.
//!
//! The gateway is the only path to the container runtime daemon on a host.
//! Corral never holds a store transaction across a gateway call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use corral_core::VolumeBinding;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Address of the host daemon.
    pub host_address: String,
    pub image: String,
    pub command: String,
    pub name: String,
    /// Numeric user the process runs as.
    pub user: String,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    /// Container-side mount points.
    pub volumes: Vec<String>,
    /// Comma-joined core labels.
    pub cpuset: String,
    /// Container ports to expose.
    pub exposed_ports: Vec<u16>,
    pub network: String,
}

/// Options applied when starting a created container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Container port to host port.
    pub port_bindings: BTreeMap<u16, u16>,
    pub binds: Vec<VolumeBinding>,
}

/// Container runtime interface.
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Create a container and return its runtime id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, runtime_id: &str, options: &StartOptions) -> Result<()>;

    async fn stop(&self, runtime_id: &str) -> Result<()>;

    async fn remove(&self, runtime_id: &str) -> Result<()>;
}

/// Gateway that talks to no daemon. Mints ids and logs what it would do.
#[derive(Default)]
pub struct DryRunGateway {
    containers: Mutex<HashMap<String, bool>>,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of containers created and not yet removed.
    pub fn container_ids(&self) -> Vec<String> {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, runtime_id: &str) -> bool {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.get(runtime_id).copied().unwrap_or(false)
    }

    fn set_running(&self, runtime_id: &str, running: bool) -> Result<()> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        match containers.get_mut(runtime_id) {
            Some(state) => {
                *state = running;
                Ok(())
            }
            None => anyhow::bail!("no such container: {runtime_id}"),
        }
    }
}

#[async_trait]
impl RuntimeGateway for DryRunGateway {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let runtime_id = Uuid::new_v4().simple().to_string();
        info!(
            host = %spec.host_address,
            image = %spec.image,
            name = %spec.name,
            cpuset = %spec.cpuset,
            runtime_id = %runtime_id,
            "[DRY RUN] create container"
        );
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(runtime_id.clone(), false);
        Ok(runtime_id)
    }

    async fn start(&self, runtime_id: &str, options: &StartOptions) -> Result<()> {
        debug!(runtime_id, ports = ?options.port_bindings, "[DRY RUN] start container");
        self.set_running(runtime_id, true)
    }

    async fn stop(&self, runtime_id: &str) -> Result<()> {
        debug!(runtime_id, "[DRY RUN] stop container");
        self.set_running(runtime_id, false)
    }

    async fn remove(&self, runtime_id: &str) -> Result<()> {
        debug!(runtime_id, "[DRY RUN] remove container");
        match self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(runtime_id)
        {
            Some(_) => Ok(()),
            None => anyhow::bail!("no such container: {runtime_id}"),
        }
    }
}
