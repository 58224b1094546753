//! Hosts, their core/port inventory, and tenant assignment.
//!
//! `reserve_step` is the allocator's critical section: one write
//! transaction that re-reads a host's inventory, lets the caller decide how
//! many containers fit, and marks the chosen cores and ports reserved. The
//! decision is made against the committed state of that instant, so two
//! concurrent allocations can never pick the same core.

use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{
    StateStore, claim_name, load, load_all, next_id, put_json, read_group_pod, require,
};
use crate::tables::*;
use crate::types::*;

/// Registration data for a new host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewHost {
    pub pod_id: PodId,
    pub address: String,
    pub name: String,
    pub uid: String,
    pub ncore: u32,
    pub memory: u64,
}

/// What the allocator sees while deciding one host.
#[derive(Debug)]
pub struct HostStep<'a> {
    pub host: &'a Host,
    pub inventory: &'a HostInventory,
    /// Cores the requesting group already holds on public hosts of the pod,
    /// reserved or occupied. Zero for private hosts.
    pub public_cores_held: u32,
    /// The group's public-pool authorization on the pod, if any.
    pub grant: Option<&'a GroupPod>,
}

/// Cores and ports reserved on one host by a single step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostGrant {
    pub host_id: HostId,
    /// Number of containers the grant covers.
    pub count: u32,
    /// `count * cores_per_container` core labels, in label order.
    pub cores: Vec<String>,
    /// Either empty or exactly `count` ports.
    pub ports: Vec<u16>,
}

impl StateStore {
    // ── Hosts ──────────────────────────────────────────────────────

    /// Register a host with `ncore` cores and the given port range. New hosts
    /// are `Unowned` until assigned to a group or published.
    pub fn create_host(
        &self,
        new: &NewHost,
        ports: impl IntoIterator<Item = u16>,
    ) -> StateResult<Host> {
        if new.ncore == 0 {
            return Err(StateError::InvalidRequest(format!(
                "host {} has no cores",
                new.name
            )));
        }
        let ports: Vec<u16> = ports.into_iter().collect();
        let host = self.write(|txn| {
            require::<Pod>(txn, PODS, new.pod_id, "pod")?;
            let id = next_id(txn, "host")?;
            claim_name(txn, "host", &new.name, id)?;
            let host = Host {
                id,
                pod_id: new.pod_id,
                address: new.address.clone(),
                name: new.name.clone(),
                uid: new.uid.clone(),
                ncore: new.ncore,
                memory: new.memory,
                ownership: HostOwnership::Unowned,
            };
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            put_json(&mut hosts, id, &host)?;
            let mut inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
            put_json(&mut inventories, id, &HostInventory::new(id, new.ncore, ports))?;
            Ok(host)
        })?;
        info!(host = %host.name, id = host.id, pod_id = host.pod_id, ncore = host.ncore, "host registered");
        Ok(host)
    }

    pub fn get_host(&self, id: HostId) -> StateResult<Option<Host>> {
        let txn = self.read()?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    pub fn get_inventory(&self, host_id: HostId) -> StateResult<Option<HostInventory>> {
        let txn = self.read()?;
        let table = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
        load(&table, host_id)
    }

    /// Hosts of a pod in ascending id order.
    pub fn list_hosts_in_pod(&self, pod_id: PodId) -> StateResult<Vec<Host>> {
        let txn = self.read()?;
        let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        Ok(load_all::<Host>(&table)?
            .into_iter()
            .filter(|h| h.pod_id == pod_id)
            .collect())
    }

    /// Hosts of a pod with their inventories, read from one snapshot.
    pub fn pod_snapshot(&self, pod_id: PodId) -> StateResult<Vec<(Host, HostInventory)>> {
        let txn = self.read()?;
        let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        let inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for host in load_all::<Host>(&hosts)? {
            if host.pod_id != pod_id {
                continue;
            }
            let inventory = load::<HostInventory>(&inventories, host.id)?
                .ok_or_else(|| StateError::NotFound(format!("inventory of host {}", host.id)))?;
            results.push((host, inventory));
        }
        Ok(results)
    }

    /// Cores a group holds on public hosts of a pod, reserved or occupied.
    pub fn public_cores_held(&self, group_id: GroupId, pod_id: PodId) -> StateResult<u32> {
        Ok(self
            .pod_snapshot(pod_id)?
            .iter()
            .filter(|(host, _)| host.is_public())
            .map(|(_, inventory)| inventory.cores_held_by(group_id))
            .sum())
    }

    // ── Assignment ─────────────────────────────────────────────────

    /// Make a host private to `group_id`. Re-assigning to the same group is
    /// a no-op.
    pub fn assign_host(&self, group_id: GroupId, host_id: HostId) -> StateResult<Host> {
        let host = self.write(|txn| {
            require::<Group>(txn, GROUPS, group_id, "group")?;
            set_ownership(txn, host_id, HostOwnership::Private { group_id })
        })?;
        info!(host_id, group_id, "host assigned to group");
        Ok(host)
    }

    /// Make every unassigned host of the pod private to `group_id`. Hosts
    /// already private to another group or in the public pool are left
    /// alone, as are unassigned hosts where another group still holds
    /// units. Returns the ids of the hosts now private to the group,
    /// including those that already were.
    pub fn assign_pod(&self, group_id: GroupId, pod_id: PodId) -> StateResult<Vec<HostId>> {
        let assigned = self.write(|txn| {
            require::<Group>(txn, GROUPS, group_id, "group")?;
            require::<Pod>(txn, PODS, pod_id, "pod")?;
            let candidates: Vec<HostId> = {
                let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
                load_all::<Host>(&hosts)?
                    .into_iter()
                    .filter(|h| {
                        h.pod_id == pod_id
                            && match h.ownership {
                                HostOwnership::Unowned => true,
                                HostOwnership::Private { group_id: owner } => owner == group_id,
                                HostOwnership::PublicPool => false,
                            }
                    })
                    .map(|h| h.id)
                    .collect()
            };
            let mut assigned = Vec::new();
            for host_id in candidates {
                match set_ownership(txn, host_id, HostOwnership::Private { group_id }) {
                    Ok(_) => assigned.push(host_id),
                    Err(StateError::AlreadyAssigned { group_id: other, .. }) => {
                        debug!(host_id, other, "host held by another group, skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(assigned)
        })?;
        info!(pod_id, group_id, hosts = assigned.len(), "pod assigned to group");
        Ok(assigned)
    }

    /// Move a host into the pod's public pool. Cores already held on the
    /// host start counting as public usage of their groups, so publishing is
    /// refused with `Conflict` when that would take a group over its quota.
    pub fn publish_host(&self, host_id: HostId) -> StateResult<Host> {
        let host = self.write(|txn| set_ownership(txn, host_id, HostOwnership::PublicPool))?;
        info!(host_id, "host published to public pool");
        Ok(host)
    }

    /// Take a host out of scheduling. Containers already on it keep their
    /// cores until deleted.
    pub fn unassign_host(&self, host_id: HostId) -> StateResult<Host> {
        self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut host: Host = load(&hosts, host_id)?
                .ok_or_else(|| StateError::NotFound(format!("host {host_id}")))?;
            host.ownership = HostOwnership::Unowned;
            put_json(&mut hosts, host_id, &host)?;
            Ok(host)
        })
    }

    // ── Occupancy ──────────────────────────────────────────────────

    /// Reserve cores (and ports, if `with_port`) for some number of
    /// containers on one host, atomically.
    ///
    /// `decide` receives the host as committed at this instant and returns
    /// how many containers to take. Returns `None` when the host is no longer
    /// usable by the reservation's group or `decide` returns zero.
    pub fn reserve_step<F>(
        &self,
        reservation: &Reservation,
        host_id: HostId,
        cores_per_container: u32,
        with_port: bool,
        decide: F,
    ) -> StateResult<Option<HostGrant>>
    where
        F: FnOnce(&HostStep<'_>) -> u32,
    {
        if cores_per_container == 0 {
            return Err(StateError::InvalidRequest(
                "cores_per_container must be positive".to_string(),
            ));
        }
        let grant = self.write(|txn| {
            let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
            let host: Host = load(&hosts, host_id)?
                .ok_or_else(|| StateError::NotFound(format!("host {host_id}")))?;
            if host.pod_id != reservation.pod_id || !host.usable_by(reservation.group_id) {
                return Ok(None);
            }
            let mut inventory: HostInventory = load(&inventories, host_id)?
                .ok_or_else(|| StateError::NotFound(format!("inventory of host {host_id}")))?;

            let grant = {
                let grants = txn.open_table(GROUP_PODS).map_err(map_err!(Table))?;
                read_group_pod(&grants, reservation.group_id, reservation.pod_id)?
            };
            let public_cores_held = if host.is_public() {
                let mut held = 0;
                for other in load_all::<Host>(&hosts)? {
                    if other.pod_id != host.pod_id || !other.is_public() {
                        continue;
                    }
                    let other_inventory = if other.id == host_id {
                        inventory.clone()
                    } else {
                        load::<HostInventory>(&inventories, other.id)?.ok_or_else(|| {
                            StateError::NotFound(format!("inventory of host {}", other.id))
                        })?
                    };
                    held += other_inventory.cores_held_by(reservation.group_id);
                }
                held
            } else {
                0
            };

            let take = decide(&HostStep {
                host: &host,
                inventory: &inventory,
                public_cores_held,
                grant: grant.as_ref(),
            });
            if take == 0 {
                return Ok(None);
            }
            let cores = take * cores_per_container;
            let ports = if with_port { take } else { 0 };
            if cores > inventory.free_cores() || ports > inventory.free_ports() {
                return Err(StateError::Conflict(format!(
                    "host {host_id} cannot fit {take} containers of {cores_per_container} cores"
                )));
            }
            let (cores, ports) =
                inventory.reserve(reservation.id, reservation.group_id, cores, ports);
            put_json(&mut inventories, host_id, &inventory)?;
            Ok(Some(HostGrant {
                host_id,
                count: take,
                cores,
                ports,
            }))
        })?;
        if let Some(grant) = &grant {
            debug!(
                reservation_id = reservation.id,
                host_id,
                count = grant.count,
                cores = ?grant.cores,
                ports = ?grant.ports,
                "cores reserved"
            );
        }
        Ok(grant)
    }

    /// Mark cores free. Already-free cores are skipped; an unknown label
    /// fails the whole call. Returns the number of cores freed.
    pub fn release_cores<S: AsRef<str>>(&self, host_id: HostId, labels: &[S]) -> StateResult<u32> {
        let freed = self.update_inventory(host_id, |inventory| inventory.release_cores(labels))?;
        debug!(host_id, freed, "cores released");
        Ok(freed)
    }

    /// Mark a port free. Returns true if it was held.
    pub fn release_port(&self, host_id: HostId, port: u16) -> StateResult<bool> {
        self.update_inventory(host_id, |inventory| inventory.release_port(port))
    }

    fn update_inventory<R>(
        &self,
        host_id: HostId,
        f: impl FnOnce(&mut HostInventory) -> StateResult<R>,
    ) -> StateResult<R> {
        self.write(|txn| {
            let mut inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
            let mut inventory: HostInventory = load(&inventories, host_id)?
                .ok_or_else(|| StateError::NotFound(format!("host {host_id}")))?;
            let result = f(&mut inventory)?;
            put_json(&mut inventories, host_id, &inventory)?;
            Ok(result)
        })
    }
}

/// Change a host's ownership. A host can only become private to a group if
/// no other group owns it or holds cores or ports on it.
fn set_ownership(
    txn: &WriteTransaction,
    host_id: HostId,
    ownership: HostOwnership,
) -> StateResult<Host> {
    let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
    let mut host: Host =
        load(&hosts, host_id)?.ok_or_else(|| StateError::NotFound(format!("host {host_id}")))?;
    if host.ownership == ownership {
        return Ok(host);
    }
    if ownership == HostOwnership::PublicPool {
        check_public_quota(txn, &hosts, &host)?;
    }
    if let Some(group_id) = ownership.private_group() {
        if let Some(owner) = host.ownership.private_group() {
            return Err(StateError::AlreadyAssigned {
                host_id,
                group_id: owner,
            });
        }
        let inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
        let inventory: HostInventory = load(&inventories, host_id)?
            .ok_or_else(|| StateError::NotFound(format!("inventory of host {host_id}")))?;
        if let Some(foreign) = inventory
            .holding_groups()
            .into_iter()
            .find(|g| *g != group_id)
        {
            return Err(StateError::AlreadyAssigned {
                host_id,
                group_id: foreign,
            });
        }
    }
    host.ownership = ownership;
    put_json(&mut hosts, host_id, &host)?;
    Ok(host)
}

/// Every group holding units on `host` must stay within its public quota
/// once those units count as public usage.
fn check_public_quota(
    txn: &WriteTransaction,
    hosts: &impl ReadableTable<u64, &'static [u8]>,
    host: &Host,
) -> StateResult<()> {
    let inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
    let inventory: HostInventory = load(&inventories, host.id)?
        .ok_or_else(|| StateError::NotFound(format!("inventory of host {}", host.id)))?;
    let holders = inventory.holding_groups();
    if holders.is_empty() {
        return Ok(());
    }

    let mut public = Vec::new();
    for other in load_all::<Host>(hosts)? {
        if other.pod_id == host.pod_id && other.is_public() && other.id != host.id {
            if let Some(other_inventory) = load::<HostInventory>(&inventories, other.id)? {
                public.push(other_inventory);
            }
        }
    }
    let grants = txn.open_table(GROUP_PODS).map_err(map_err!(Table))?;
    for group_id in holders {
        let held = inventory.cores_held_by(group_id)
            + public.iter().map(|inv| inv.cores_held_by(group_id)).sum::<u32>();
        let quota = read_group_pod(&grants, group_id, host.pod_id)?.map_or(0, |g| g.core_quota);
        if held > quota {
            return Err(StateError::Conflict(format!(
                "publishing host {} would give group {group_id} {held} public cores, over its quota of {quota}",
                host.id
            )));
        }
    }
    Ok(())
}
