//! Resource allocator: first-fit core and port reservation.
//!
//! `allocate` visits the group's eligible hosts in a fixed order (private
//! hosts, then public hosts, each by ascending id) and reserves as many
//! containers as fit on each host until demand is met. Every host is one
//! store transaction; nothing is held between hosts. A request that cannot
//! be met in full releases what it already reserved.

use corral_core::CorralConfig;
use corral_state::{
    GroupId, HostGrant, HostId, PodId, ReservationId, StateError, StateResult, StateStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capacity::{self, containers_fitting, has_room, host_fit, quota_remaining};

/// Cores and ports reserved on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub host_id: HostId,
    /// Number of containers placed on this host.
    pub count: u32,
    pub cores: Vec<String>,
    pub ports: Vec<u16>,
}

impl From<HostGrant> for PlanEntry {
    fn from(grant: HostGrant) -> Self {
        Self {
            host_id: grant.host_id,
            count: grant.count,
            cores: grant.cores,
            ports: grant.ports,
        }
    }
}

/// The cores and port of one container-to-be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub host_id: HostId,
    pub cores: Vec<String>,
    pub port: Option<u16>,
}

/// Result of a successful [`Allocator::allocate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    /// `None` for an empty plan.
    pub reservation_id: Option<ReservationId>,
    pub group_id: GroupId,
    pub pod_id: PodId,
    pub cores_per_container: u32,
    pub entries: Vec<PlanEntry>,
}

impl AllocationPlan {
    pub fn container_count(&self) -> u32 {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split the plan into one slot per container, in plan order.
    pub fn slots(&self) -> Vec<Slot> {
        let n = self.cores_per_container as usize;
        let mut slots = Vec::new();
        for entry in &self.entries {
            for i in 0..entry.count as usize {
                slots.push(Slot {
                    host_id: entry.host_id,
                    cores: entry.cores[i * n..(i + 1) * n].to_vec(),
                    port: entry.ports.get(i).copied(),
                });
            }
        }
        slots
    }
}

/// Allocator over a state store.
#[derive(Clone)]
pub struct Allocator {
    store: StateStore,
    public_host_limit: usize,
}

impl Allocator {
    pub fn new(store: StateStore, config: &CorralConfig) -> Self {
        Self {
            store,
            public_host_limit: config.public_host_limit,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// How many containers of `cores_per_container` the group could start in
    /// the pod. Advisory: a concurrent allocation may take the capacity.
    pub fn max_containers(
        &self,
        group_id: GroupId,
        pod_id: PodId,
        cores_per_container: u32,
    ) -> StateResult<u32> {
        require_cores(cores_per_container)?;
        self.require_scope(group_id, pod_id)?;
        let snapshot = self.store.pod_snapshot(pod_id)?;
        let grant = self.store.get_group_pod(group_id, pod_id)?;
        Ok(capacity::max_containers(
            &snapshot,
            group_id,
            grant.as_ref(),
            cores_per_container,
            self.public_host_limit,
        ))
    }

    /// Reserve cores (and one port each, if `with_port`) for
    /// `desired_count` containers. All or nothing.
    pub fn allocate(
        &self,
        group_id: GroupId,
        pod_id: PodId,
        desired_count: u32,
        cores_per_container: u32,
        with_port: bool,
    ) -> StateResult<AllocationPlan> {
        require_cores(cores_per_container)?;
        self.require_scope(group_id, pod_id)?;
        let mut plan = AllocationPlan {
            reservation_id: None,
            group_id,
            pod_id,
            cores_per_container,
            entries: Vec::new(),
        };
        if desired_count == 0 {
            return Ok(plan);
        }

        let reservation = self.store.begin_reservation(group_id, pod_id)?;
        plan.reservation_id = Some(reservation.id);

        let hosts = self.store.list_hosts_in_pod(pod_id)?;
        let mut remaining = desired_count;
        let mut port_bound = false;
        let mut public_visited = 0;
        for host in capacity::visiting_order(&hosts, group_id) {
            if remaining == 0 {
                break;
            }
            if host.is_public() && public_visited == self.public_host_limit {
                break;
            }
            let mut had_room = false;
            let step = self.store.reserve_step(
                &reservation,
                host.id,
                cores_per_container,
                with_port,
                |step| {
                    had_room = has_room(step.inventory, cores_per_container);
                    let mut take =
                        containers_fitting(step.inventory.free_cores(), cores_per_container)
                            .min(remaining);
                    if step.host.is_public() {
                        let quota = quota_remaining(step.grant, step.public_cores_held);
                        take = take.min(containers_fitting(quota, cores_per_container));
                    }
                    let fitted = take.min(host_fit(step.inventory, cores_per_container, with_port));
                    if fitted < take {
                        port_bound = true;
                    }
                    fitted
                },
            );
            // Only public hosts that had room when visited count toward the
            // limit, so full hosts never hide free ones further along.
            if host.is_public() && had_room {
                public_visited += 1;
            }
            match step {
                Ok(Some(grant)) => {
                    remaining -= grant.count;
                    plan.entries.push(grant.into());
                }
                Ok(None) => debug!(host_id = host.id, "host skipped"),
                Err(e) => {
                    self.store.release_reservation(reservation.id)?;
                    return Err(e);
                }
            }
        }

        if remaining > 0 {
            let available = desired_count - remaining;
            self.store.release_reservation(reservation.id)?;
            warn!(
                group_id,
                pod_id,
                desired_count,
                available,
                port_bound,
                "allocation failed, reservation released"
            );
            return Err(if port_bound {
                StateError::PortExhausted {
                    requested: desired_count,
                    available,
                }
            } else {
                StateError::InsufficientCapacity {
                    requested: desired_count,
                    available,
                }
            });
        }

        info!(
            group_id,
            pod_id,
            reservation_id = reservation.id,
            containers = desired_count,
            hosts = plan.entries.len(),
            "allocation reserved"
        );
        Ok(plan)
    }

    /// Free specific cores on a host.
    pub fn release(&self, host_id: HostId, labels: &[String]) -> StateResult<u32> {
        self.store.release_cores(host_id, labels)
    }

    /// Free whatever part of a plan has not been committed to containers.
    pub fn release_plan(&self, plan: &AllocationPlan) -> StateResult<u32> {
        match plan.reservation_id {
            Some(id) => self.store.release_reservation(id),
            None => Ok(0),
        }
    }

    /// Release every outstanding reservation. Only sound while no
    /// allocation is in flight, i.e. before the daemon starts serving.
    /// Returns the number of reservations dropped and of units freed.
    pub fn release_stale_reservations(&self) -> StateResult<(usize, u32)> {
        let stale = self.store.list_reservations()?;
        let mut freed = 0;
        for reservation in &stale {
            freed += self.store.release_reservation(reservation.id)?;
        }
        if !stale.is_empty() {
            warn!(reservations = stale.len(), freed, "stale reservations released");
        }
        Ok((stale.len(), freed))
    }

    fn require_scope(&self, group_id: GroupId, pod_id: PodId) -> StateResult<()> {
        if self.store.get_group(group_id)?.is_none() {
            return Err(StateError::NotFound(format!("group {group_id}")));
        }
        if self.store.get_pod(pod_id)?.is_none() {
            return Err(StateError::NotFound(format!("pod {pod_id}")));
        }
        Ok(())
    }
}

fn require_cores(cores_per_container: u32) -> StateResult<()> {
    if cores_per_container == 0 {
        return Err(StateError::InvalidRequest(
            "cores_per_container must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::thread;

    use corral_state::{Group, Host, NewHost, Pod};

    use super::*;

    struct Fixture {
        alloc: Allocator,
        pod: Pod,
        group: Group,
        hosts: Vec<Host>,
    }

    /// Pod with `nhosts` hosts of 4 cores and 2 ports; the first `private`
    /// are private to the group.
    fn fixture(nhosts: usize, private: usize) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let config = CorralConfig::default();
        let pod = store.create_pod("pod", "").unwrap();
        let group = store.create_group("G", "").unwrap();
        let hosts: Vec<Host> = (0..nhosts)
            .map(|i| {
                store
                    .create_host(
                        &NewHost {
                            pod_id: pod.id,
                            address: format!("10.0.0.{}", i + 1),
                            name: format!("host-{i}"),
                            uid: format!("uid-{i}"),
                            ncore: 4,
                            memory: 4096,
                        },
                        config.port_numbers(),
                    )
                    .unwrap()
            })
            .collect();
        for host in &hosts[..private] {
            store.assign_host(group.id, host.id).unwrap();
        }
        Fixture {
            alloc: Allocator::new(store, &config),
            pod,
            group,
            hosts,
        }
    }

    fn free_cores(f: &Fixture) -> Vec<u32> {
        f.hosts
            .iter()
            .map(|h| f.alloc.store().get_inventory(h.id).unwrap().unwrap().free_cores())
            .collect()
    }

    #[test]
    fn full_private_capacity() {
        let f = fixture(6, 3);
        assert_eq!(f.alloc.max_containers(f.group.id, f.pod.id, 1).unwrap(), 12);

        let plan = f.alloc.allocate(f.group.id, f.pod.id, 12, 1, false).unwrap();
        let placed: Vec<(HostId, u32)> = plan.entries.iter().map(|e| (e.host_id, e.count)).collect();
        assert_eq!(
            placed,
            vec![(f.hosts[0].id, 4), (f.hosts[1].id, 4), (f.hosts[2].id, 4)]
        );
        assert_eq!(free_cores(&f), vec![0, 0, 0, 4, 4, 4]);
    }

    #[test]
    fn three_core_containers_leave_one_core_per_host() {
        let f = fixture(6, 3);
        assert_eq!(f.alloc.max_containers(f.group.id, f.pod.id, 3).unwrap(), 3);

        let plan = f.alloc.allocate(f.group.id, f.pod.id, 3, 3, false).unwrap();
        assert_eq!(plan.entries.len(), 3);
        assert!(plan.entries.iter().all(|e| e.count == 1 && e.cores.len() == 3));
        assert_eq!(free_cores(&f), vec![1, 1, 1, 4, 4, 4]);
    }

    #[test]
    fn allocation_stops_once_demand_is_met() {
        let f = fixture(6, 3);
        let plan = f.alloc.allocate(f.group.id, f.pod.id, 4, 2, false).unwrap();
        let placed: Vec<(HostId, u32)> = plan.entries.iter().map(|e| (e.host_id, e.count)).collect();
        assert_eq!(placed, vec![(f.hosts[0].id, 2), (f.hosts[1].id, 2)]);
        assert_eq!(free_cores(&f)[2], 4);
    }

    #[test]
    fn shortfall_leaves_state_untouched() {
        let f = fixture(6, 3);
        let before = free_cores(&f);

        let err = f.alloc.allocate(f.group.id, f.pod.id, 13, 1, false).unwrap_err();
        assert!(matches!(
            err,
            StateError::InsufficientCapacity {
                requested: 13,
                available: 12
            }
        ));
        assert_eq!(free_cores(&f), before);
        assert!(f.alloc.store().list_reservations().unwrap().is_empty());
    }

    #[test]
    fn plan_is_one_to_one_with_reserved_cores() {
        let f = fixture(6, 3);
        let plan = f.alloc.allocate(f.group.id, f.pod.id, 5, 2, false).unwrap();
        assert_eq!(plan.container_count(), 5);

        let mut seen = BTreeSet::new();
        for entry in &plan.entries {
            assert_eq!(entry.cores.len() as u32, entry.count * 2);
            for core in &entry.cores {
                assert!(seen.insert((entry.host_id, core.clone())));
            }
        }
        let reserved: u32 = free_cores(&f).iter().map(|free| 4 - free).sum();
        assert_eq!(reserved, 10);

        let slots = plan.slots();
        assert_eq!(slots.len(), 5);
        assert!(slots.iter().all(|s| s.cores.len() == 2 && s.port.is_none()));
    }

    #[test]
    fn release_restores_free_cores() {
        let f = fixture(6, 3);
        let before = free_cores(&f);

        let plan = f.alloc.allocate(f.group.id, f.pod.id, 6, 1, false).unwrap();
        for entry in &plan.entries {
            assert_eq!(f.alloc.release(entry.host_id, &entry.cores).unwrap(), entry.count);
        }
        assert_eq!(free_cores(&f), before);

        let plan = f.alloc.allocate(f.group.id, f.pod.id, 6, 1, true).unwrap();
        assert_eq!(f.alloc.release_plan(&plan).unwrap(), 12);
        assert_eq!(free_cores(&f), before);
        assert_eq!(f.alloc.release_plan(&plan).unwrap(), 0);
    }

    #[test]
    fn degenerate_requests() {
        let f = fixture(2, 2);
        let plan = f.alloc.allocate(f.group.id, f.pod.id, 0, 1, false).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.reservation_id, None);

        assert!(matches!(
            f.alloc.allocate(f.group.id, f.pod.id, 1, 0, false),
            Err(StateError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.alloc.max_containers(f.group.id, f.pod.id, 0),
            Err(StateError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.alloc.allocate(99, f.pod.id, 1, 1, false),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn ports_can_be_the_binding_constraint() {
        let f = fixture(1, 1);
        // 4 cores but only 2 ports.
        let err = f.alloc.allocate(f.group.id, f.pod.id, 3, 1, true).unwrap_err();
        assert!(matches!(
            err,
            StateError::PortExhausted {
                requested: 3,
                available: 2
            }
        ));
        assert_eq!(free_cores(&f), vec![4]);

        let plan = f.alloc.allocate(f.group.id, f.pod.id, 2, 1, true).unwrap();
        assert_eq!(plan.entries[0].ports, vec![49000, 49001]);
        assert_eq!(
            plan.slots().iter().map(|s| s.port).collect::<Vec<_>>(),
            vec![Some(49000), Some(49001)]
        );
    }

    #[test]
    fn public_quota_caps_allocation() {
        let f = fixture(3, 1);
        let store = f.alloc.store();
        store.publish_host(f.hosts[1].id).unwrap();
        store.publish_host(f.hosts[2].id).unwrap();

        // Not authorized on the public pool yet.
        assert_eq!(f.alloc.max_containers(f.group.id, f.pod.id, 1).unwrap(), 4);
        store.authorize_group(f.pod.id, f.group.id, 5).unwrap();
        assert_eq!(f.alloc.max_containers(f.group.id, f.pod.id, 1).unwrap(), 9);

        let plan = f.alloc.allocate(f.group.id, f.pod.id, 7, 1, false).unwrap();
        let placed: Vec<(HostId, u32)> = plan.entries.iter().map(|e| (e.host_id, e.count)).collect();
        assert_eq!(placed, vec![(f.hosts[0].id, 4), (f.hosts[1].id, 3)]);
        assert_eq!(store.public_cores_held(f.group.id, f.pod.id).unwrap(), 3);

        // 2 cores of quota left, whatever the hosts have free.
        let err = f.alloc.allocate(f.group.id, f.pod.id, 3, 1, false).unwrap_err();
        assert!(matches!(
            err,
            StateError::InsufficientCapacity {
                requested: 3,
                available: 2
            }
        ));
        assert!(f.alloc.allocate(f.group.id, f.pod.id, 2, 1, false).is_ok());
    }

    #[test]
    fn other_groups_hosts_are_never_used() {
        let f = fixture(2, 1);
        let other = f.alloc.store().create_group("other", "").unwrap();
        f.alloc.store().assign_host(other.id, f.hosts[1].id).unwrap();

        let plan = f.alloc.allocate(f.group.id, f.pod.id, 4, 1, false).unwrap();
        assert!(plan.entries.iter().all(|e| e.host_id == f.hosts[0].id));
        assert!(f.alloc.allocate(f.group.id, f.pod.id, 1, 1, false).is_err());
    }

    #[test]
    fn concurrent_allocations_never_share_a_core() {
        let f = fixture(6, 6);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = f.alloc.clone();
                let (group_id, pod_id) = (f.group.id, f.pod.id);
                thread::spawn(move || alloc.allocate(group_id, pod_id, 3, 2, false).unwrap())
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            let plan = handle.join().unwrap();
            assert_eq!(plan.container_count(), 3);
            for entry in plan.entries {
                for core in entry.cores {
                    assert!(seen.insert((entry.host_id, core)), "core handed out twice");
                }
            }
        }
        assert_eq!(seen.len(), 24);
        assert_eq!(free_cores(&f), vec![0; 6]);
    }

    #[test]
    fn full_public_hosts_are_passed_over() {
        let f = fixture(2, 0);
        let store = f.alloc.store().clone();
        let config = CorralConfig {
            public_host_limit: 1,
            ..CorralConfig::default()
        };
        let alloc = Allocator::new(store.clone(), &config);
        let other = store.create_group("other", "").unwrap();
        for host in &f.hosts {
            store.publish_host(host.id).unwrap();
        }
        store.authorize_group(f.pod.id, other.id, 4).unwrap();
        store.authorize_group(f.pod.id, f.group.id, 4).unwrap();

        let filled = alloc.allocate(other.id, f.pod.id, 4, 1, false).unwrap();
        assert_eq!(filled.entries[0].host_id, f.hosts[0].id);

        assert_eq!(alloc.max_containers(f.group.id, f.pod.id, 1).unwrap(), 4);
        let plan = alloc.allocate(f.group.id, f.pod.id, 4, 1, false).unwrap();
        let placed: Vec<(HostId, u32)> = plan.entries.iter().map(|e| (e.host_id, e.count)).collect();
        assert_eq!(placed, vec![(f.hosts[1].id, 4)]);
    }

    #[test]
    fn concurrent_public_allocations_stay_within_quota() {
        let f = fixture(6, 0);
        let store = f.alloc.store();
        for host in &f.hosts {
            store.publish_host(host.id).unwrap();
        }
        store.authorize_group(f.pod.id, f.group.id, 10).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = f.alloc.clone();
                let (group_id, pod_id) = (f.group.id, f.pod.id);
                thread::spawn(move || alloc.allocate(group_id, pod_id, 2, 1, false))
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(plan) => granted += plan.container_count(),
                Err(StateError::InsufficientCapacity { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(granted <= 10, "quota overshot: {granted} cores");
        assert_eq!(store.public_cores_held(f.group.id, f.pod.id).unwrap(), granted);
        assert!(store.list_reservations().unwrap().len() <= 5);
    }

    #[test]
    fn stale_reservations_are_released_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.redb");
        let config = CorralConfig::default();
        let host_id = {
            let store = StateStore::open(&path).unwrap();
            let pod = store.create_pod("pod", "").unwrap();
            let group = store.create_group("G", "").unwrap();
            let host = store
                .create_host(
                    &NewHost {
                        pod_id: pod.id,
                        address: "10.0.0.1".to_string(),
                        name: "host-0".to_string(),
                        uid: "uid-0".to_string(),
                        ncore: 4,
                        memory: 4096,
                    },
                    config.port_numbers(),
                )
                .unwrap();
            store.assign_host(group.id, host.id).unwrap();
            // Reserved but never committed, as if the daemon died mid-placement.
            let alloc = Allocator::new(store, &config);
            alloc.allocate(group.id, pod.id, 2, 2, true).unwrap();
            host.id
        };

        let alloc = Allocator::new(StateStore::open(&path).unwrap(), &config);
        let inventory = alloc.store().get_inventory(host_id).unwrap().unwrap();
        assert_eq!(inventory.free_cores(), 0);

        assert_eq!(alloc.release_stale_reservations().unwrap(), (1, 6));
        let inventory = alloc.store().get_inventory(host_id).unwrap().unwrap();
        assert_eq!(inventory.free_cores(), 4);
        assert_eq!(inventory.free_ports(), 2);
        assert!(alloc.store().list_reservations().unwrap().is_empty());
        assert_eq!(alloc.release_stale_reservations().unwrap(), (0, 0));
    }
}
