//! Domain types for the Corral state store.
//!
//! These types represent pods, groups, hosts and their core/port inventory,
//! applications, versions, containers and tasks. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{StateError, StateResult};

pub type PodId = u64;
pub type GroupId = u64;
pub type HostId = u64;
pub type AppId = u64;
pub type VersionId = u64;
pub type TaskId = u64;
pub type ReservationId = u64;

/// Runtime-assigned container identifier.
pub type ContainerId = String;

// ── Pod / Group ───────────────────────────────────────────────────

/// A named pool of hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub id: PodId,
    pub name: String,
    pub description: String,
}

/// A tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: String,
}

/// Authorization of a group on a pod's public pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupPod {
    pub group_id: GroupId,
    pub pod_id: PodId,
    /// Maximum cores the group may hold on the pod's public hosts.
    pub core_quota: u32,
}

impl GroupPod {
    /// Build the composite key for the group_pods table.
    pub fn table_key(&self) -> String {
        group_pod_key(self.group_id, self.pod_id)
    }
}

pub fn group_pod_key(group_id: GroupId, pod_id: PodId) -> String {
    format!("{group_id}:{pod_id}")
}

// ── Host ──────────────────────────────────────────────────────────

/// Who may schedule onto a host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostOwnership {
    /// Registered but not yet handed to anyone; never scheduled onto.
    Unowned,
    /// Usable only by one group.
    Private { group_id: GroupId },
    /// Shared by every group authorized on the pod, under quota.
    PublicPool,
}

impl HostOwnership {
    pub fn private_group(&self) -> Option<GroupId> {
        match self {
            HostOwnership::Private { group_id } => Some(*group_id),
            _ => None,
        }
    }
}

/// A physical machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub id: HostId,
    pub pod_id: PodId,
    pub address: String,
    pub name: String,
    /// Identity token reported by the host agent.
    pub uid: String,
    pub ncore: u32,
    /// Total memory in bytes. Informational, not scheduled.
    pub memory: u64,
    pub ownership: HostOwnership,
}

impl Host {
    pub fn is_public(&self) -> bool {
        self.ownership == HostOwnership::PublicPool
    }

    /// Whether `group_id` may schedule onto this host at all.
    pub fn usable_by(&self, group_id: GroupId) -> bool {
        match self.ownership {
            HostOwnership::Private { group_id: owner } => owner == group_id,
            HostOwnership::PublicPool => true,
            HostOwnership::Unowned => false,
        }
    }
}

// ── Inventory ─────────────────────────────────────────────────────

/// Occupancy of a single core or port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Occupancy {
    Free,
    /// Held by an allocation that has not been committed to a container.
    Reserved {
        reservation_id: ReservationId,
        group_id: GroupId,
    },
    Occupied {
        container_id: ContainerId,
        group_id: GroupId,
    },
}

impl Occupancy {
    pub fn is_free(&self) -> bool {
        matches!(self, Occupancy::Free)
    }

    pub fn group(&self) -> Option<GroupId> {
        match self {
            Occupancy::Free => None,
            Occupancy::Reserved { group_id, .. } | Occupancy::Occupied { group_id, .. } => {
                Some(*group_id)
            }
        }
    }

    pub fn container(&self) -> Option<&str> {
        match self {
            Occupancy::Occupied { container_id, .. } => Some(container_id),
            _ => None,
        }
    }

    pub fn reservation(&self) -> Option<ReservationId> {
        match self {
            Occupancy::Reserved { reservation_id, .. } => Some(*reservation_id),
            _ => None,
        }
    }

    fn is_reservation(&self, id: ReservationId) -> bool {
        self.reservation() == Some(id)
    }

    /// Move into `Occupied { container_id }`. Fails if another container
    /// already holds the unit.
    fn occupy(&mut self, container_id: &str, group_id: GroupId) -> Result<(), String> {
        if let Occupancy::Occupied {
            container_id: holder,
            ..
        } = self
        {
            if holder.as_str() != container_id {
                return Err(holder.clone());
            }
        }
        *self = Occupancy::Occupied {
            container_id: container_id.to_string(),
            group_id,
        };
        Ok(())
    }
}

/// A schedulable CPU core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Core {
    pub label: String,
    pub state: Occupancy,
}

/// A schedulable TCP port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Port {
    pub number: u16,
    pub state: Occupancy,
}

/// The cores and ports of one host. Core order is label order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostInventory {
    pub host_id: HostId,
    pub cores: Vec<Core>,
    pub ports: Vec<Port>,
}

impl HostInventory {
    /// Fresh inventory with cores labelled `"0".."ncore-1"`.
    pub fn new(host_id: HostId, ncore: u32, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            host_id,
            cores: (0..ncore)
                .map(|i| Core {
                    label: i.to_string(),
                    state: Occupancy::Free,
                })
                .collect(),
            ports: ports
                .into_iter()
                .map(|number| Port {
                    number,
                    state: Occupancy::Free,
                })
                .collect(),
        }
    }

    pub fn free_cores(&self) -> u32 {
        self.cores.iter().filter(|c| c.state.is_free()).count() as u32
    }

    pub fn free_ports(&self) -> u32 {
        self.ports.iter().filter(|p| p.state.is_free()).count() as u32
    }

    pub fn free_core_labels(&self) -> Vec<&str> {
        self.cores
            .iter()
            .filter(|c| c.state.is_free())
            .map(|c| c.label.as_str())
            .collect()
    }

    /// Cores reserved or occupied on behalf of `group_id`.
    pub fn cores_held_by(&self, group_id: GroupId) -> u32 {
        self.cores
            .iter()
            .filter(|c| c.state.group() == Some(group_id))
            .count() as u32
    }

    /// Groups holding at least one core or port on this host.
    pub fn holding_groups(&self) -> BTreeSet<GroupId> {
        self.cores
            .iter()
            .map(|c| &c.state)
            .chain(self.ports.iter().map(|p| &p.state))
            .filter_map(Occupancy::group)
            .collect()
    }

    /// Mark the first `cores` free cores and first `ports` free ports as
    /// reserved. The caller must have checked that enough are free.
    pub fn reserve(
        &mut self,
        reservation_id: ReservationId,
        group_id: GroupId,
        cores: u32,
        ports: u32,
    ) -> (Vec<String>, Vec<u16>) {
        let state = Occupancy::Reserved {
            reservation_id,
            group_id,
        };
        let labels = self
            .cores
            .iter_mut()
            .filter(|c| c.state.is_free())
            .take(cores as usize)
            .map(|c| {
                c.state = state.clone();
                c.label.clone()
            })
            .collect();
        let numbers = self
            .ports
            .iter_mut()
            .filter(|p| p.state.is_free())
            .take(ports as usize)
            .map(|p| {
                p.state = state.clone();
                p.number
            })
            .collect();
        (labels, numbers)
    }

    /// Free the given cores. Already-free cores are left alone; unknown
    /// labels fail before anything changes.
    pub fn release_cores<S: AsRef<str>>(&mut self, labels: &[S]) -> StateResult<u32> {
        let mut indices = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.as_ref();
            let idx = self
                .cores
                .iter()
                .position(|c| c.label == label)
                .ok_or_else(|| StateError::UnknownCore {
                    host_id: self.host_id,
                    label: label.to_string(),
                })?;
            indices.push(idx);
        }
        let mut freed = 0;
        for idx in indices {
            let core = &mut self.cores[idx];
            if !core.state.is_free() {
                core.state = Occupancy::Free;
                freed += 1;
            }
        }
        Ok(freed)
    }

    pub fn release_port(&mut self, number: u16) -> StateResult<bool> {
        let port = self
            .ports
            .iter_mut()
            .find(|p| p.number == number)
            .ok_or(StateError::UnknownPort {
                host_id: self.host_id,
                port: number,
            })?;
        let was_held = !port.state.is_free();
        port.state = Occupancy::Free;
        Ok(was_held)
    }

    /// Whether any core or port is still reserved under `reservation_id`.
    pub fn holds_reservation(&self, reservation_id: ReservationId) -> bool {
        self.cores
            .iter()
            .map(|c| &c.state)
            .chain(self.ports.iter().map(|p| &p.state))
            .any(|state| state.is_reservation(reservation_id))
    }

    /// Free everything still reserved under `reservation_id`.
    pub fn release_reservation(&mut self, reservation_id: ReservationId) -> u32 {
        let mut freed = 0;
        for state in self.units_mut() {
            if state.is_reservation(reservation_id) {
                *state = Occupancy::Free;
                freed += 1;
            }
        }
        freed
    }

    /// Hand the given cores and port to a container.
    pub fn occupy(
        &mut self,
        container_id: &str,
        group_id: GroupId,
        labels: &[String],
        port: Option<u16>,
    ) -> StateResult<()> {
        let host_id = self.host_id;
        let conflict = |unit: String, holder: String| {
            StateError::Conflict(format!(
                "{unit} on host {host_id} is held by container {holder}"
            ))
        };
        for label in labels {
            let core = self
                .cores
                .iter_mut()
                .find(|c| &c.label == label)
                .ok_or_else(|| StateError::UnknownCore {
                    host_id,
                    label: label.clone(),
                })?;
            core.state
                .occupy(container_id, group_id)
                .map_err(|holder| conflict(format!("core {label}"), holder))?;
        }
        if let Some(number) = port {
            let port = self
                .ports
                .iter_mut()
                .find(|p| p.number == number)
                .ok_or(StateError::UnknownPort {
                    host_id,
                    port: number,
                })?;
            port.state
                .occupy(container_id, group_id)
                .map_err(|holder| conflict(format!("port {number}"), holder))?;
        }
        Ok(())
    }

    /// Free every core and port held by `container_id`.
    pub fn vacate(&mut self, container_id: &str) -> u32 {
        let mut freed = 0;
        for state in self.units_mut() {
            if state.container() == Some(container_id) {
                *state = Occupancy::Free;
                freed += 1;
            }
        }
        freed
    }

    fn units_mut(&mut self) -> impl Iterator<Item = &mut Occupancy> {
        self.cores
            .iter_mut()
            .map(|c| &mut c.state)
            .chain(self.ports.iter_mut().map(|p| &mut p.state))
    }
}

/// A provisional allocation awaiting commit or release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub group_id: GroupId,
    pub pod_id: PodId,
    pub created_at: u64,
}

// ── App / Version ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub id: AppId,
    pub name: String,
    pub git: String,
    /// Owning tenant.
    pub group_id: GroupId,
}

/// A named way to run a version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entrypoint {
    pub cmd: String,
    /// Container port exposed by this entrypoint, if any.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Build and run definition captured with a version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub appname: String,
    pub build: String,
    pub entrypoints: BTreeMap<String, Entrypoint>,
}

/// Immutable snapshot of an app at one source revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Version {
    pub id: VersionId,
    pub app_id: AppId,
    pub sha: String,
    pub short_sha: String,
    pub config: AppConfig,
    pub created_at: u64,
}

// ── Container ─────────────────────────────────────────────────────

/// Container lifecycle. `Requested` exists only before allocation and is
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Requested,
    Reserved,
    Running,
    Dead,
}

impl ContainerState {
    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Requested, Reserved) | (Reserved, Running) | (Reserved, Dead) | (Running, Dead)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub id: ContainerId,
    pub host_id: HostId,
    pub pod_id: PodId,
    pub group_id: GroupId,
    pub version_id: VersionId,
    pub name: String,
    pub entrypoint: String,
    pub cores: Vec<String>,
    pub port: Option<u16>,
    pub state: ContainerState,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Container {
    pub fn is_alive(&self) -> bool {
        self.state != ContainerState::Dead
    }
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Build,
    Deploy,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// An asynchronous job record owned by external orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub version_id: VersionId,
    pub host_id: HostId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> HostInventory {
        HostInventory::new(1, 4, [49000, 49001])
    }

    #[test]
    fn new_inventory_is_free() {
        let inv = inventory();
        assert_eq!(inv.free_cores(), 4);
        assert_eq!(inv.free_ports(), 2);
        assert_eq!(inv.free_core_labels(), vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn reserve_takes_first_free_in_label_order() {
        let mut inv = inventory();
        let (cores, ports) = inv.reserve(7, 1, 3, 1);
        assert_eq!(cores, vec!["0", "1", "2"]);
        assert_eq!(ports, vec![49000]);
        assert_eq!(inv.free_core_labels(), vec!["3"]);
        assert_eq!(inv.cores_held_by(1), 3);
        assert_eq!(inv.cores_held_by(2), 0);
    }

    #[test]
    fn release_is_idempotent_and_rejects_unknown_labels() {
        let mut inv = inventory();
        inv.reserve(7, 1, 2, 0);

        assert_eq!(inv.release_cores(&["0", "1"]).unwrap(), 2);
        assert_eq!(inv.release_cores(&["0", "1"]).unwrap(), 0);
        assert_eq!(inv.free_cores(), 4);

        inv.reserve(8, 1, 1, 0);
        let err = inv.release_cores(&["0", "42"]).unwrap_err();
        assert!(matches!(err, StateError::UnknownCore { host_id: 1, .. }));
        // Nothing released when any label is unknown.
        assert_eq!(inv.free_cores(), 3);
    }

    #[test]
    fn occupy_and_vacate() {
        let mut inv = inventory();
        let (cores, ports) = inv.reserve(7, 1, 2, 1);
        inv.occupy("c1", 1, &cores, ports.first().copied()).unwrap();

        assert_eq!(inv.cores[0].state.container(), Some("c1"));
        assert_eq!(inv.holding_groups(), BTreeSet::from([1]));

        assert_eq!(inv.vacate("c1"), 3);
        assert_eq!(inv.free_cores(), 4);
        assert_eq!(inv.free_ports(), 2);
    }

    #[test]
    fn occupy_rejects_core_held_by_other_container() {
        let mut inv = inventory();
        inv.occupy("c1", 1, &["0".to_string()], None).unwrap();
        // Same container again is fine.
        inv.occupy("c1", 1, &["0".to_string()], None).unwrap();

        let err = inv.occupy("c2", 1, &["0".to_string()], None).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn release_reservation_only_touches_its_own_units() {
        let mut inv = inventory();
        inv.reserve(7, 1, 2, 1);
        inv.reserve(8, 2, 1, 1);

        assert_eq!(inv.release_reservation(7), 3);
        assert_eq!(inv.free_cores(), 3);
        assert_eq!(inv.cores_held_by(2), 1);
    }

    #[test]
    fn container_state_machine() {
        use ContainerState::*;
        assert!(Requested.can_transition_to(Reserved));
        assert!(Reserved.can_transition_to(Running));
        assert!(Reserved.can_transition_to(Dead));
        assert!(Running.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Running));
        assert!(!Running.can_transition_to(Reserved));
        assert!(!Requested.can_transition_to(Running));
    }

    #[test]
    fn ownership_usability() {
        let mut host = Host {
            id: 1,
            pod_id: 1,
            address: "10.0.0.1".to_string(),
            name: "host-1".to_string(),
            uid: "uid".to_string(),
            ncore: 4,
            memory: 4096,
            ownership: HostOwnership::Unowned,
        };
        assert!(!host.usable_by(1));

        host.ownership = HostOwnership::Private { group_id: 1 };
        assert!(host.usable_by(1));
        assert!(!host.usable_by(2));

        host.ownership = HostOwnership::PublicPool;
        assert!(host.usable_by(2));
        assert!(host.is_public());
    }
}
