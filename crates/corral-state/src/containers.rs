//! Container lifecycle: commit a reservation to a container, mark it
//! running, kill it.
//!
//! Each transition and the occupancy change it implies run in one write
//! transaction, so a container row and the cores it holds never disagree.

use std::collections::BTreeSet;

use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{
    StateStore, decode, encode, epoch_secs, load, load_all, load_all_by_str, put_json, require,
};
use crate::tables::*;
use crate::types::*;

/// A container the runtime has created on reserved cores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewContainer {
    /// Runtime-assigned id.
    pub id: ContainerId,
    pub host_id: HostId,
    pub version_id: VersionId,
    pub name: String,
    pub entrypoint: String,
    pub cores: Vec<String>,
    pub port: Option<u16>,
}

impl StateStore {
    /// Record a container and hand it its cores and port.
    ///
    /// The cores must be free or reserved for the version's group. A
    /// reservation left without reserved units is dropped.
    pub fn commit_container(&self, new: &NewContainer) -> StateResult<Container> {
        if new.cores.is_empty() {
            return Err(StateError::InvalidRequest(format!(
                "container {} has no cores",
                new.id
            )));
        }
        let container = self.write(|txn| {
            let version: Version = require(txn, VERSIONS, new.version_id, "version")?;
            let app: App = require(txn, APPS, version.app_id, "app")?;
            let host: Host = require(txn, HOSTS, new.host_id, "host")?;
            if !host.usable_by(app.group_id) {
                return Err(StateError::InvalidRequest(format!(
                    "host {} is not usable by group {}",
                    host.id, app.group_id
                )));
            }

            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            if containers
                .get(new.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(format!("container {}", new.id)));
            }

            let mut inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
            let mut inventory: HostInventory = load(&inventories, host.id)?
                .ok_or_else(|| StateError::NotFound(format!("inventory of host {}", host.id)))?;

            let mut touched = BTreeSet::new();
            for core in inventory.cores.iter().filter(|c| new.cores.contains(&c.label)) {
                check_claimable(&core.state, app.group_id, &format!("core {}", core.label))?;
                touched.extend(core.state.reservation());
            }
            if let Some(number) = new.port {
                if let Some(port) = inventory.ports.iter().find(|p| p.number == number) {
                    check_claimable(&port.state, app.group_id, &format!("port {number}"))?;
                    touched.extend(port.state.reservation());
                }
            }
            inventory.occupy(&new.id, app.group_id, &new.cores, new.port)?;
            put_json(&mut inventories, host.id, &inventory)?;
            drop(inventories);

            for reservation_id in touched {
                drop_if_consumed(txn, reservation_id)?;
            }

            let now = epoch_secs();
            let container = Container {
                id: new.id.clone(),
                host_id: host.id,
                pod_id: host.pod_id,
                group_id: app.group_id,
                version_id: version.id,
                name: new.name.clone(),
                entrypoint: new.entrypoint.clone(),
                cores: new.cores.clone(),
                port: new.port,
                state: ContainerState::Reserved,
                created_at: now,
                updated_at: now,
            };
            let value = encode(&container)?;
            containers
                .insert(container.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(container)
        })?;
        info!(
            container = %container.id,
            host_id = container.host_id,
            cores = ?container.cores,
            port = ?container.port,
            "container committed"
        );
        Ok(container)
    }

    /// `Reserved -> Running`. Marking a running container again is a no-op.
    pub fn mark_running(&self, id: &str) -> StateResult<Container> {
        self.write(|txn| {
            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let mut container = load_container(&containers, id)?
                .ok_or_else(|| StateError::NotFound(format!("container {id}")))?;
            let state = container.state;
            match state {
                ContainerState::Running => return Ok(container),
                from if !from.can_transition_to(ContainerState::Running) => {
                    return Err(StateError::InvalidTransition {
                        from,
                        to: ContainerState::Running,
                    });
                }
                _ => {}
            }
            container.state = ContainerState::Running;
            container.updated_at = epoch_secs();
            let value = encode(&container)?;
            containers
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(container)
        })
    }

    /// Mark a container dead and free its cores and port. The row is kept.
    /// Killing a dead container is a no-op.
    pub fn kill_container(&self, id: &str) -> StateResult<Container> {
        let (container, freed) = self.write(|txn| {
            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let mut container = load_container(&containers, id)?
                .ok_or_else(|| StateError::NotFound(format!("container {id}")))?;
            if !container.is_alive() {
                return Ok((container, 0));
            }

            let mut inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
            let mut freed = 0;
            if let Some(mut inventory) = load::<HostInventory>(&inventories, container.host_id)? {
                freed = inventory.vacate(id);
                put_json(&mut inventories, container.host_id, &inventory)?;
            }

            container.state = ContainerState::Dead;
            container.updated_at = epoch_secs();
            let value = encode(&container)?;
            containers
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok((container, freed))
        })?;
        if freed > 0 {
            info!(container = %id, host_id = container.host_id, freed, "container killed");
        }
        Ok(container)
    }

    pub fn get_container(&self, id: &str) -> StateResult<Option<Container>> {
        let txn = self.read()?;
        let table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        load_container(&table, id)
    }

    /// Containers on a host, dead ones included.
    pub fn list_containers_on_host(&self, host_id: HostId) -> StateResult<Vec<Container>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| c.host_id == host_id)
            .collect())
    }

    pub fn list_containers_for_version(
        &self,
        version_id: VersionId,
        alive_only: bool,
    ) -> StateResult<Vec<Container>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| c.version_id == version_id && (!alive_only || c.is_alive()))
            .collect())
    }

    pub fn list_containers(&self) -> StateResult<Vec<Container>> {
        let txn = self.read()?;
        let table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        load_all_by_str(&table)
    }
}

fn load_container(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> StateResult<Option<Container>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

/// A unit may be claimed when it is free or held on behalf of `group_id`.
fn check_claimable(state: &Occupancy, group_id: GroupId, unit: &str) -> StateResult<()> {
    match state.group() {
        Some(holder) if holder != group_id => Err(StateError::Conflict(format!(
            "{unit} is held by group {holder}"
        ))),
        _ => Ok(()),
    }
}

/// Delete a reservation once no host of its pod holds a unit under it.
fn drop_if_consumed(txn: &WriteTransaction, reservation_id: ReservationId) -> StateResult<()> {
    let mut reservations = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
    let Some(reservation) = load::<Reservation>(&reservations, reservation_id)? else {
        return Ok(());
    };
    let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
    let inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
    for host in load_all::<Host>(&hosts)? {
        if host.pod_id != reservation.pod_id {
            continue;
        }
        if let Some(inventory) = load::<HostInventory>(&inventories, host.id)? {
            if inventory.holds_reservation(reservation_id) {
                return Ok(());
            }
        }
    }
    reservations
        .remove(reservation_id)
        .map_err(map_err!(Write))?;
    debug!(reservation_id, "reservation consumed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::NewHost;

    struct Fixture {
        store: StateStore,
        pod: Pod,
        group: Group,
        host: Host,
        version: Version,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let pod = store.create_pod("pod", "").unwrap();
        let group = store.create_group("group", "").unwrap();
        let host = store
            .create_host(
                &NewHost {
                    pod_id: pod.id,
                    address: "10.0.0.1".to_string(),
                    name: "host-1".to_string(),
                    uid: "uid-1".to_string(),
                    ncore: 4,
                    memory: 4096,
                },
                [49000, 49001],
            )
            .unwrap();
        store.assign_host(group.id, host.id).unwrap();
        let app = store.get_or_create_app("web", "git", group.id).unwrap();
        let version = store
            .add_version(
                app.id,
                "0123456789",
                AppConfig {
                    appname: "web".to_string(),
                    build: "make".to_string(),
                    entrypoints: BTreeMap::from([(
                        "web".to_string(),
                        Entrypoint {
                            cmd: "./web".to_string(),
                            port: Some(5000),
                        },
                    )]),
                },
            )
            .unwrap();
        Fixture {
            store,
            pod,
            group,
            host,
            version,
        }
    }

    fn new_container(f: &Fixture, id: &str, cores: &[&str], port: Option<u16>) -> NewContainer {
        NewContainer {
            id: id.to_string(),
            host_id: f.host.id,
            version_id: f.version.id,
            name: format!("web_web_{id}"),
            entrypoint: "web".to_string(),
            cores: cores.iter().map(|c| c.to_string()).collect(),
            port,
        }
    }

    fn reserve(f: &Fixture, cores_per_container: u32) -> (Reservation, crate::HostGrant) {
        let reservation = f.store.begin_reservation(f.group.id, f.pod.id).unwrap();
        let grant = f
            .store
            .reserve_step(&reservation, f.host.id, cores_per_container, true, |_| 1)
            .unwrap()
            .unwrap();
        (reservation, grant)
    }

    #[test]
    fn commit_consumes_reservation() {
        let f = fixture();
        let (reservation, grant) = reserve(&f, 2);
        let cores: Vec<&str> = grant.cores.iter().map(String::as_str).collect();

        let container = f
            .store
            .commit_container(&new_container(&f, "c1", &cores, grant.ports.first().copied()))
            .unwrap();
        assert_eq!(container.state, ContainerState::Reserved);
        assert_eq!(container.group_id, f.group.id);
        assert_eq!(container.pod_id, f.pod.id);

        let inv = f.store.get_inventory(f.host.id).unwrap().unwrap();
        assert_eq!(inv.cores[0].state.container(), Some("c1"));
        assert_eq!(inv.ports[0].state.container(), Some("c1"));
        assert!(!inv.holds_reservation(reservation.id));
        assert!(f.store.list_reservations().unwrap().is_empty());
    }

    #[test]
    fn commit_rejects_empty_cores_and_duplicates() {
        let f = fixture();
        assert!(matches!(
            f.store.commit_container(&new_container(&f, "c1", &[], None)),
            Err(StateError::InvalidRequest(_))
        ));

        f.store
            .commit_container(&new_container(&f, "c1", &["0"], None))
            .unwrap();
        assert!(matches!(
            f.store.commit_container(&new_container(&f, "c1", &["1"], None)),
            Err(StateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn commit_rejects_core_of_another_container() {
        let f = fixture();
        f.store
            .commit_container(&new_container(&f, "c1", &["0", "1"], None))
            .unwrap();

        let err = f
            .store
            .commit_container(&new_container(&f, "c2", &["1", "2"], None))
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
        // Aborted: core 2 is still free and c2 was never written.
        let inv = f.store.get_inventory(f.host.id).unwrap().unwrap();
        assert!(inv.cores[2].state.is_free());
        assert!(f.store.get_container("c2").unwrap().is_none());
    }

    #[test]
    fn commit_requires_host_usable_by_group() {
        let f = fixture();
        f.store.unassign_host(f.host.id).unwrap();
        assert!(matches!(
            f.store.commit_container(&new_container(&f, "c1", &["0"], None)),
            Err(StateError::InvalidRequest(_))
        ));
    }

    #[test]
    fn lifecycle_transitions() {
        let f = fixture();
        f.store
            .commit_container(&new_container(&f, "c1", &["0"], Some(49000)))
            .unwrap();

        let running = f.store.mark_running("c1").unwrap();
        assert_eq!(running.state, ContainerState::Running);
        assert_eq!(f.store.mark_running("c1").unwrap().state, ContainerState::Running);

        let dead = f.store.kill_container("c1").unwrap();
        assert_eq!(dead.state, ContainerState::Dead);
        assert!(matches!(
            f.store.mark_running("c1"),
            Err(StateError::InvalidTransition {
                from: ContainerState::Dead,
                to: ContainerState::Running
            })
        ));
        assert!(matches!(
            f.store.mark_running("missing"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn kill_frees_resources_and_is_idempotent() {
        let f = fixture();
        f.store
            .commit_container(&new_container(&f, "c1", &["0", "1"], Some(49000)))
            .unwrap();

        f.store.kill_container("c1").unwrap();
        let inv = f.store.get_inventory(f.host.id).unwrap().unwrap();
        assert_eq!(inv.free_cores(), 4);
        assert_eq!(inv.free_ports(), 2);

        // Row kept, second kill changes nothing.
        let again = f.store.kill_container("c1").unwrap();
        assert_eq!(again.state, ContainerState::Dead);
        assert!(matches!(
            f.store.kill_container("missing"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn listing_by_host_and_version() {
        let f = fixture();
        f.store
            .commit_container(&new_container(&f, "c1", &["0"], None))
            .unwrap();
        f.store
            .commit_container(&new_container(&f, "c2", &["1"], None))
            .unwrap();
        f.store.kill_container("c1").unwrap();

        assert_eq!(f.store.list_containers_on_host(f.host.id).unwrap().len(), 2);
        let alive = f
            .store
            .list_containers_for_version(f.version.id, true)
            .unwrap();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, "c2");
        assert_eq!(
            f.store
                .list_containers_for_version(f.version.id, false)
                .unwrap()
                .len(),
            2
        );
    }
}
