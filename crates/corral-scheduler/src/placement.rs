//! Placement service: from request to running containers.
//!
//! ```text
//! place()
//!   ├── validate (version, entrypoint, group)
//!   ├── Allocator::allocate          (reserve cores/ports)
//!   └── per container
//!       ├── RuntimeGateway::create_container
//!       ├── Lifecycle::create        (commit reservation)
//!       ├── RuntimeGateway::start
//!       └── Lifecycle::mark_running
//! ```
//!
//! Any failure tears down the containers already committed and releases
//! the rest of the plan, so a failed request leaves no reserved cores.

use std::sync::Arc;

use corral_core::{CorralConfig, ResourceConfig, image_tag};
use corral_placement::{AllocationPlan, Allocator, Slot};
use corral_state::{
    App, Container, GroupId, HostId, PodId, StateError, StateStore, Version, VersionId,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::{container_binds, container_env, container_name, cpuset};
use crate::error::{SchedulerError, SchedulerResult};
use crate::gateway::{ContainerSpec, RuntimeGateway, StartOptions};
use crate::lifecycle::{ContainerRequest, Lifecycle};

/// A request to run `desired_count` containers of one entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub group_id: GroupId,
    pub pod_id: PodId,
    pub version_id: VersionId,
    pub entrypoint: String,
    /// Run environment name, exported upper-cased as `NBE_RUNENV`.
    pub env: String,
    pub desired_count: u32,
    pub cores_per_container: u32,
    #[serde(default)]
    pub resources: ResourceConfig,
}

/// A container that was created, committed and started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedContainer {
    pub id: String,
    pub host_id: HostId,
    pub name: String,
    pub cores: Vec<String>,
    pub port: Option<u16>,
}

impl From<Container> for PlacedContainer {
    fn from(c: Container) -> Self {
        Self {
            id: c.id,
            host_id: c.host_id,
            name: c.name,
            cores: c.cores,
            port: c.port,
        }
    }
}

/// Everything needed to launch containers of one request, resolved once.
struct LaunchContext {
    app: App,
    version: Version,
    pod_name: String,
    command: String,
    entry_port: Option<u16>,
}

#[derive(Clone)]
pub struct PlacementService {
    store: StateStore,
    allocator: Allocator,
    lifecycle: Lifecycle,
    gateway: Arc<dyn RuntimeGateway>,
    config: Arc<CorralConfig>,
}

impl PlacementService {
    pub fn new(store: StateStore, config: CorralConfig, gateway: Arc<dyn RuntimeGateway>) -> Self {
        Self {
            allocator: Allocator::new(store.clone(), &config),
            lifecycle: Lifecycle::new(store.clone()),
            store,
            gateway,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn config(&self) -> &CorralConfig {
        &self.config
    }

    /// Allocate, create and start the requested containers. All or nothing.
    pub async fn place(&self, request: &PlacementRequest) -> SchedulerResult<Vec<PlacedContainer>> {
        let ctx = self.resolve(request)?;
        let plan = self.allocator.allocate(
            request.group_id,
            request.pod_id,
            request.desired_count,
            request.cores_per_container,
            ctx.entry_port.is_some(),
        )?;

        let mut placed = Vec::with_capacity(plan.container_count() as usize);
        for slot in plan.slots() {
            match self.launch(request, &ctx, slot).await {
                Ok(container) => placed.push(container),
                Err(e) => {
                    warn!(
                        version_id = request.version_id,
                        entrypoint = %request.entrypoint,
                        placed = placed.len(),
                        error = %e,
                        "placement failed, rolling back"
                    );
                    self.roll_back(&plan, &placed).await;
                    return Err(e);
                }
            }
        }

        info!(
            app = %ctx.app.name,
            version = %ctx.version.short_sha,
            entrypoint = %request.entrypoint,
            containers = placed.len(),
            "containers placed"
        );
        Ok(placed)
    }

    /// Stop and remove a container, then free its cores and port. Runtime
    /// failures are logged; the resources are released regardless.
    pub async fn remove(&self, container_id: &str) -> SchedulerResult<Container> {
        let container = self.lifecycle.get(container_id)?;
        if container.is_alive() {
            self.discard_runtime(container_id).await;
        }
        self.lifecycle.delete(container_id)
    }

    fn resolve(&self, request: &PlacementRequest) -> SchedulerResult<LaunchContext> {
        if request.desired_count == 0 || request.cores_per_container == 0 {
            return Err(invalid("desired_count and cores_per_container must be positive"));
        }
        let version = self
            .store
            .get_version(request.version_id)?
            .ok_or_else(|| StateError::NotFound(format!("version {}", request.version_id)))?;
        let entrypoint = version
            .config
            .entrypoints
            .get(&request.entrypoint)
            .cloned()
            .ok_or_else(|| invalid(&format!("unknown entrypoint {:?}", request.entrypoint)))?;
        let app = self
            .store
            .get_app(version.app_id)?
            .ok_or_else(|| StateError::NotFound(format!("app {}", version.app_id)))?;
        if app.group_id != request.group_id {
            return Err(invalid(&format!(
                "app {} does not belong to group {}",
                app.name, request.group_id
            )));
        }
        let pod = self
            .store
            .get_pod(request.pod_id)?
            .ok_or_else(|| StateError::NotFound(format!("pod {}", request.pod_id)))?;
        Ok(LaunchContext {
            app,
            version,
            pod_name: pod.name,
            command: entrypoint.cmd,
            entry_port: entrypoint.port,
        })
    }

    async fn launch(
        &self,
        request: &PlacementRequest,
        ctx: &LaunchContext,
        slot: Slot,
    ) -> SchedulerResult<PlacedContainer> {
        let host = self
            .store
            .get_host(slot.host_id)?
            .ok_or_else(|| StateError::NotFound(format!("host {}", slot.host_id)))?;
        let appname = &ctx.version.config.appname;
        let name = container_name(appname, &request.entrypoint);
        let spec = ContainerSpec {
            host_address: host.address.clone(),
            image: image_tag(&self.config.registry, appname, &ctx.version.short_sha),
            command: ctx.command.clone(),
            name: name.clone(),
            user: ctx.app.id.to_string(),
            working_dir: format!("/{appname}"),
            env: container_env(
                &self.config,
                appname,
                &request.env,
                &ctx.pod_name,
                &request.resources,
            ),
            volumes: vec![self.config.container_permdir_for(appname)],
            cpuset: cpuset(&slot.cores),
            exposed_ports: ctx.entry_port.into_iter().collect(),
            network: self.config.network.clone(),
        };

        let runtime_id = self
            .gateway
            .create_container(&spec)
            .await
            .map_err(SchedulerError::gateway)?;

        let committed = self.lifecycle.create(&ContainerRequest {
            id: runtime_id.clone(),
            host_id: host.id,
            version_id: ctx.version.id,
            name,
            entrypoint: request.entrypoint.clone(),
            cores: slot.cores,
            port: slot.port,
        });
        let container = match committed {
            Ok(container) => container,
            Err(e) => {
                if let Err(remove_err) = self.gateway.remove(&runtime_id).await {
                    warn!(runtime_id = %runtime_id, error = %remove_err, "failed to remove uncommitted container");
                }
                return Err(e);
            }
        };

        let options = StartOptions {
            port_bindings: match (ctx.entry_port, slot.port) {
                (Some(inner), Some(outer)) => [(inner, outer)].into(),
                _ => Default::default(),
            },
            binds: container_binds(&self.config, appname, &request.resources),
        };
        let started = self.gateway.start(&runtime_id, &options).await;
        if let Err(e) = started {
            self.discard_runtime(&runtime_id).await;
            self.lifecycle.delete(&runtime_id)?;
            return Err(SchedulerError::gateway(e));
        }
        match self.lifecycle.mark_running(&runtime_id) {
            Ok(container) => Ok(container.into()),
            Err(e) => {
                self.discard_runtime(&runtime_id).await;
                if let Err(delete_err) = self.lifecycle.delete(&runtime_id) {
                    warn!(runtime_id = %runtime_id, error = %delete_err, "failed to release unstarted container");
                }
                Err(e)
            }
        }
    }

    async fn roll_back(&self, plan: &AllocationPlan, placed: &[PlacedContainer]) {
        for container in placed {
            self.discard_runtime(&container.id).await;
            if let Err(e) = self.lifecycle.delete(&container.id) {
                warn!(container = %container.id, error = %e, "rollback delete failed");
            }
        }
        if let Err(e) = self.allocator.release_plan(plan) {
            warn!(reservation_id = ?plan.reservation_id, error = %e, "rollback release failed");
        }
    }

    async fn discard_runtime(&self, runtime_id: &str) {
        if let Err(e) = self.gateway.stop(runtime_id).await {
            warn!(runtime_id, error = %e, "runtime stop failed");
        }
        if let Err(e) = self.gateway.remove(runtime_id).await {
            warn!(runtime_id, error = %e, "runtime remove failed");
        }
    }
}

fn invalid(message: &str) -> SchedulerError {
    StateError::InvalidRequest(message.to_string()).into()
}
