//! StateStore — redb-backed state persistence for Corral.
//!
//! Provides typed CRUD operations over pods, groups, public-pool
//! authorizations, apps, versions, tasks and reservations. Host inventory
//! and container lifecycle transactions live in `inventory` and
//! `containers`. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            txn.open_table(NAMES).map_err(map_err!(Table))?;
            txn.open_table(PODS).map_err(map_err!(Table))?;
            txn.open_table(GROUPS).map_err(map_err!(Table))?;
            txn.open_table(GROUP_PODS).map_err(map_err!(Table))?;
            txn.open_table(HOSTS).map_err(map_err!(Table))?;
            txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
            txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            txn.open_table(APPS).map_err(map_err!(Table))?;
            txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            txn.open_table(TASKS).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` inside one write transaction. The transaction commits when
    /// `f` succeeds and is aborted, leaving no trace, when it fails.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    pub(crate) fn read(&self) -> StateResult<ReadTransaction> {
        self.db.begin_read().map_err(map_err!(Transaction))
    }

    // ── Pods ───────────────────────────────────────────────────────

    /// Create a pod. Names are unique.
    pub fn create_pod(&self, name: &str, description: &str) -> StateResult<Pod> {
        let pod = self.write(|txn| {
            let id = next_id(txn, "pod")?;
            claim_name(txn, "pod", name, id)?;
            let pod = Pod {
                id,
                name: name.to_string(),
                description: description.to_string(),
            };
            let mut pods = txn.open_table(PODS).map_err(map_err!(Table))?;
            put_json(&mut pods, id, &pod)?;
            Ok(pod)
        })?;
        debug!(pod = %pod.name, id = pod.id, "pod created");
        Ok(pod)
    }

    pub fn get_pod(&self, id: PodId) -> StateResult<Option<Pod>> {
        let txn = self.read()?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    pub fn get_pod_by_name(&self, name: &str) -> StateResult<Option<Pod>> {
        match self.lookup_name("pod", name)? {
            Some(id) => self.get_pod(id),
            None => Ok(None),
        }
    }

    pub fn list_pods(&self) -> StateResult<Vec<Pod>> {
        let txn = self.read()?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        load_all(&table)
    }

    /// Delete a pod that no host references. Returns true if it existed.
    pub fn delete_pod(&self, id: PodId) -> StateResult<bool> {
        let existed = self.write(|txn| {
            let mut pods = txn.open_table(PODS).map_err(map_err!(Table))?;
            let Some(pod) = load::<Pod>(&pods, id)? else {
                return Ok(false);
            };
            let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let in_use = load_all::<Host>(&hosts)?.iter().any(|h| h.pod_id == id);
            if in_use {
                return Err(StateError::PodInUse(pod.name));
            }
            pods.remove(id).map_err(map_err!(Write))?;

            let mut names = txn.open_table(NAMES).map_err(map_err!(Table))?;
            names
                .remove(name_key("pod", &pod.name).as_str())
                .map_err(map_err!(Write))?;

            let mut grants = txn.open_table(GROUP_PODS).map_err(map_err!(Table))?;
            let stale: Vec<String> = load_all_by_str::<GroupPod>(&grants)?
                .into_iter()
                .filter(|g| g.pod_id == id)
                .map(|g| g.table_key())
                .collect();
            for key in &stale {
                grants.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            Ok(true)
        })?;
        debug!(pod_id = id, existed, "pod deleted");
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Create a group. Names are unique.
    pub fn create_group(&self, name: &str, description: &str) -> StateResult<Group> {
        let group = self.write(|txn| {
            let id = next_id(txn, "group")?;
            claim_name(txn, "group", name, id)?;
            let group = Group {
                id,
                name: name.to_string(),
                description: description.to_string(),
            };
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            put_json(&mut groups, id, &group)?;
            Ok(group)
        })?;
        debug!(group = %group.name, id = group.id, "group created");
        Ok(group)
    }

    pub fn get_group(&self, id: GroupId) -> StateResult<Option<Group>> {
        let txn = self.read()?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    pub fn get_group_by_name(&self, name: &str) -> StateResult<Option<Group>> {
        match self.lookup_name("group", name)? {
            Some(id) => self.get_group(id),
            None => Ok(None),
        }
    }

    pub fn list_groups(&self) -> StateResult<Vec<Group>> {
        let txn = self.read()?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        load_all(&table)
    }

    // ── Public pool authorizations ─────────────────────────────────

    /// Authorize a group on a pod's public pool with a core quota.
    /// Re-authorizing replaces the quota.
    pub fn authorize_group(
        &self,
        pod_id: PodId,
        group_id: GroupId,
        core_quota: u32,
    ) -> StateResult<GroupPod> {
        let grant = self.write(|txn| {
            require::<Pod>(txn, PODS, pod_id, "pod")?;
            require::<Group>(txn, GROUPS, group_id, "group")?;
            let grant = GroupPod {
                group_id,
                pod_id,
                core_quota,
            };
            let mut table = txn.open_table(GROUP_PODS).map_err(map_err!(Table))?;
            let value = encode(&grant)?;
            table
                .insert(grant.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(grant)
        })?;
        debug!(pod_id, group_id, core_quota, "group authorized on pod");
        Ok(grant)
    }

    pub fn get_group_pod(&self, group_id: GroupId, pod_id: PodId) -> StateResult<Option<GroupPod>> {
        let txn = self.read()?;
        let table = txn.open_table(GROUP_PODS).map_err(map_err!(Table))?;
        read_group_pod(&table, group_id, pod_id)
    }

    pub fn list_group_pods(&self, pod_id: PodId) -> StateResult<Vec<GroupPod>> {
        let txn = self.read()?;
        let table = txn.open_table(GROUP_PODS).map_err(map_err!(Table))?;
        Ok(load_all_by_str::<GroupPod>(&table)?
            .into_iter()
            .filter(|g| g.pod_id == pod_id)
            .collect())
    }

    // ── Apps / Versions ────────────────────────────────────────────

    /// Return the app named `name`, creating it for `group_id` if absent.
    pub fn get_or_create_app(&self, name: &str, git: &str, group_id: GroupId) -> StateResult<App> {
        if let Some(app) = self.get_app_by_name(name)? {
            return Ok(app);
        }
        let app = self.write(|txn| {
            require::<Group>(txn, GROUPS, group_id, "group")?;
            let id = next_id(txn, "app")?;
            claim_name(txn, "app", name, id)?;
            let app = App {
                id,
                name: name.to_string(),
                git: git.to_string(),
                group_id,
            };
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            put_json(&mut apps, id, &app)?;
            Ok(app)
        })?;
        debug!(app = %app.name, id = app.id, group_id, "app created");
        Ok(app)
    }

    pub fn get_app(&self, id: AppId) -> StateResult<Option<App>> {
        let txn = self.read()?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    pub fn get_app_by_name(&self, name: &str) -> StateResult<Option<App>> {
        match self.lookup_name("app", name)? {
            Some(id) => self.get_app(id),
            None => Ok(None),
        }
    }

    /// Record a new version of an app at `sha`.
    pub fn add_version(&self, app_id: AppId, sha: &str, config: AppConfig) -> StateResult<Version> {
        if sha.is_empty() {
            return Err(StateError::InvalidRequest("version sha is empty".to_string()));
        }
        self.write(|txn| {
            require::<App>(txn, APPS, app_id, "app")?;
            let id = next_id(txn, "version")?;
            let version = Version {
                id,
                app_id,
                sha: sha.to_string(),
                short_sha: corral_core::short_sha(sha).to_string(),
                config,
                created_at: epoch_secs(),
            };
            let mut versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            put_json(&mut versions, id, &version)?;
            Ok(version)
        })
    }

    pub fn get_version(&self, id: VersionId) -> StateResult<Option<Version>> {
        let txn = self.read()?;
        let table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    pub fn list_versions_for_app(&self, app_id: AppId) -> StateResult<Vec<Version>> {
        let txn = self.read()?;
        let table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        Ok(load_all::<Version>(&table)?
            .into_iter()
            .filter(|v| v.app_id == app_id)
            .collect())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        version_id: VersionId,
        host_id: HostId,
        kind: TaskKind,
    ) -> StateResult<Task> {
        self.write(|txn| {
            require::<Version>(txn, VERSIONS, version_id, "version")?;
            require::<Host>(txn, HOSTS, host_id, "host")?;
            let now = epoch_secs();
            let task = Task {
                id: next_id(txn, "task")?,
                version_id,
                host_id,
                kind,
                status: TaskStatus::Pending,
                created_at: now,
                updated_at: now,
            };
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            put_json(&mut tasks, task.id, &task)?;
            Ok(task)
        })
    }

    pub fn set_task_status(&self, id: TaskId, status: TaskStatus) -> StateResult<Task> {
        self.write(|txn| {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut task: Task =
                load(&tasks, id)?.ok_or_else(|| StateError::NotFound(format!("task {id}")))?;
            task.status = status;
            task.updated_at = epoch_secs();
            put_json(&mut tasks, id, &task)?;
            Ok(task)
        })
    }

    pub fn get_task(&self, id: TaskId) -> StateResult<Option<Task>> {
        let txn = self.read()?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    pub fn list_tasks_for_version(&self, version_id: VersionId) -> StateResult<Vec<Task>> {
        let txn = self.read()?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        Ok(load_all::<Task>(&table)?
            .into_iter()
            .filter(|t| t.version_id == version_id)
            .collect())
    }

    // ── Reservations ───────────────────────────────────────────────

    /// Open a reservation that allocation steps attach cores and ports to.
    pub fn begin_reservation(&self, group_id: GroupId, pod_id: PodId) -> StateResult<Reservation> {
        self.write(|txn| {
            let reservation = Reservation {
                id: next_id(txn, "reservation")?,
                group_id,
                pod_id,
                created_at: epoch_secs(),
            };
            let mut table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            put_json(&mut table, reservation.id, &reservation)?;
            Ok(reservation)
        })
    }

    /// Free everything still reserved under `id` and drop the reservation.
    /// Returns the number of cores and ports freed. Unknown ids free nothing.
    pub fn release_reservation(&self, id: ReservationId) -> StateResult<u32> {
        let freed = self.write(|txn| {
            let mut reservations = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            let Some(reservation) = load::<Reservation>(&reservations, id)? else {
                return Ok(0);
            };
            reservations.remove(id).map_err(map_err!(Write))?;

            let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut inventories = txn.open_table(INVENTORIES).map_err(map_err!(Table))?;
            let mut freed = 0;
            for host in load_all::<Host>(&hosts)? {
                if host.pod_id != reservation.pod_id {
                    continue;
                }
                let Some(mut inventory) = load::<HostInventory>(&inventories, host.id)? else {
                    continue;
                };
                let n = inventory.release_reservation(id);
                if n > 0 {
                    put_json(&mut inventories, host.id, &inventory)?;
                    freed += n;
                }
            }
            Ok(freed)
        })?;
        debug!(reservation_id = id, freed, "reservation released");
        Ok(freed)
    }

    pub fn list_reservations(&self) -> StateResult<Vec<Reservation>> {
        let txn = self.read()?;
        let table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        load_all(&table)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn lookup_name(&self, kind: &str, name: &str) -> StateResult<Option<u64>> {
        let txn = self.read()?;
        let table = txn.open_table(NAMES).map_err(map_err!(Table))?;
        let id = table
            .get(name_key(kind, name).as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        Ok(id)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Load a record from a `u64`-keyed table.
pub(crate) fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<T>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

/// Load every record of a `u64`-keyed table in ascending id order.
pub(crate) fn load_all<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

pub(crate) fn load_all_by_str<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

pub(crate) fn put_json<T: Serialize>(
    table: &mut Table<'_, u64, &'static [u8]>,
    id: u64,
    value: &T,
) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(id, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

pub(crate) fn read_group_pod(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    group_id: GroupId,
    pod_id: PodId,
) -> StateResult<Option<GroupPod>> {
    let key = group_pod_key(group_id, pod_id);
    match table.get(key.as_str()).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

/// Fail with `NotFound` unless `id` exists in `definition`.
pub(crate) fn require<T: DeserializeOwned>(
    txn: &WriteTransaction,
    definition: redb::TableDefinition<'static, u64, &'static [u8]>,
    id: u64,
    what: &str,
) -> StateResult<T> {
    let table = txn.open_table(definition).map_err(map_err!(Table))?;
    load(&table, id)?.ok_or_else(|| StateError::NotFound(format!("{what} {id}")))
}

pub(crate) fn next_id(txn: &WriteTransaction, kind: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(kind)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(kind, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn name_key(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

/// Reserve `name` for `id` in the unique name index.
pub(crate) fn claim_name(txn: &WriteTransaction, kind: &str, name: &str, id: u64) -> StateResult<()> {
    if name.is_empty() {
        return Err(StateError::InvalidRequest(format!("{kind} name is empty")));
    }
    let key = name_key(kind, name);
    let mut names = txn.open_table(NAMES).map_err(map_err!(Table))?;
    if names.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
        return Err(StateError::AlreadyExists(format!("{kind} {name}")));
    }
    names.insert(key.as_str(), id).map_err(map_err!(Write))?;
    Ok(())
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
