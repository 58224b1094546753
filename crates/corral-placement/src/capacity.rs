//! Capacity arithmetic over a pod snapshot.
//!
//! Pure functions, no storage access. The allocator applies the same rules
//! host by host inside write transactions; `max_containers` applies them to
//! one read snapshot and is therefore advisory.

use corral_state::{GroupId, GroupPod, Host, HostInventory};

/// How many containers of `cores_per_container` fit in `free_cores`.
pub fn containers_fitting(free_cores: u32, cores_per_container: u32) -> u32 {
    if cores_per_container == 0 {
        return 0;
    }
    free_cores / cores_per_container
}

/// Containers one host can take, counting ports when the containers need one.
pub fn host_fit(inventory: &HostInventory, cores_per_container: u32, with_port: bool) -> u32 {
    let by_cores = containers_fitting(inventory.free_cores(), cores_per_container);
    if with_port {
        by_cores.min(inventory.free_ports())
    } else {
        by_cores
    }
}

/// Cores left in a group's public-pool quota. Unauthorized groups have none.
pub fn quota_remaining(grant: Option<&GroupPod>, cores_held: u32) -> u32 {
    grant.map_or(0, |g| g.core_quota.saturating_sub(cores_held))
}

/// Hosts a group may schedule onto, in visiting order: its private hosts,
/// then every public host, each in ascending id.
pub fn visiting_order<'a>(
    hosts: impl IntoIterator<Item = &'a Host>,
    group_id: GroupId,
) -> Vec<&'a Host> {
    let mut hosts: Vec<&Host> = hosts.into_iter().collect();
    hosts.sort_by_key(|h| h.id);
    let (private, public): (Vec<&Host>, Vec<&Host>) = hosts
        .into_iter()
        .filter(|h| h.usable_by(group_id))
        .partition(|h| !h.is_public());
    private.into_iter().chain(public).collect()
}

/// Whether a host has room for at least one more container.
pub fn has_room(inventory: &HostInventory, cores_per_container: u32) -> bool {
    containers_fitting(inventory.free_cores(), cores_per_container) > 0
}

/// Hosts that count toward a group's capacity: its private hosts, then the
/// first `public_host_limit` public hosts that still have room for a
/// container. Full public hosts do not use up the limit.
pub fn eligible_hosts(
    snapshot: &[(Host, HostInventory)],
    group_id: GroupId,
    cores_per_container: u32,
    public_host_limit: usize,
) -> Vec<&(Host, HostInventory)> {
    let order = visiting_order(snapshot.iter().map(|(h, _)| h), group_id);
    let entry = |host: &Host| snapshot.iter().find(|(h, _)| h.id == host.id);
    let mut eligible = Vec::with_capacity(order.len());
    let mut public = 0;
    for host in order {
        let Some(pair) = entry(host) else { continue };
        if host.is_public() {
            if public == public_host_limit || !has_room(&pair.1, cores_per_container) {
                continue;
            }
            public += 1;
        }
        eligible.push(pair);
    }
    eligible
}

/// Number of containers of `cores_per_container` the group could start in
/// the pod right now.
///
/// Private hosts contribute `floor(free / n)` each. Public hosts contribute
/// the same, summed, then capped by `floor(remaining_quota / n)`.
pub fn max_containers(
    snapshot: &[(Host, HostInventory)],
    group_id: GroupId,
    grant: Option<&GroupPod>,
    cores_per_container: u32,
    public_host_limit: usize,
) -> u32 {
    let held: u32 = snapshot
        .iter()
        .filter(|(host, _)| host.is_public())
        .map(|(_, inventory)| inventory.cores_held_by(group_id))
        .sum();
    let quota_cap = containers_fitting(quota_remaining(grant, held), cores_per_container);

    let eligible = eligible_hosts(snapshot, group_id, cores_per_container, public_host_limit);
    let fit = |inv: &HostInventory| containers_fitting(inv.free_cores(), cores_per_container);

    let private: u32 = eligible
        .iter()
        .filter(|(h, _)| !h.is_public())
        .map(|(_, inv)| fit(inv))
        .sum();
    let public: u32 = if quota_cap == 0 {
        0
    } else {
        eligible
            .iter()
            .filter(|(h, _)| h.is_public())
            .map(|(_, inv)| fit(inv))
            .sum()
    };
    private + public.min(quota_cap)
}
