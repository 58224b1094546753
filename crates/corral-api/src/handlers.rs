//! REST API handlers.
//!
//! Handlers call the state store or the placement service and wrap the
//! result in the common JSON envelope. Domain errors map to 4xx statuses
//! with a machine-readable `kind`.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use corral_scheduler::{PlacementRequest, SchedulerError};
use corral_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

fn error_response(msg: &str, kind: &'static str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            kind: Some(kind),
        }),
    )
        .into_response()
}

fn state_error(e: &StateError) -> Response {
    let (status, kind) = match e {
        StateError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        StateError::UnknownCore { .. } | StateError::UnknownPort { .. } => {
            (StatusCode::BAD_REQUEST, "unknown_unit")
        }
        StateError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        StateError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
        StateError::AlreadyAssigned { .. } => (StatusCode::CONFLICT, "already_assigned"),
        StateError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        StateError::PodInUse(_) => (StatusCode::CONFLICT, "pod_in_use"),
        StateError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        StateError::InsufficientCapacity { .. } => {
            (StatusCode::CONFLICT, "insufficient_capacity")
        }
        StateError::PortExhausted { .. } => (StatusCode::CONFLICT, "port_exhausted"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    if status.is_server_error() {
        warn!(error = %e, "state store failure");
    }
    error_response(&e.to_string(), kind, status)
}

fn scheduler_error(e: &SchedulerError) -> Response {
    match e {
        SchedulerError::State(e) => state_error(e),
        SchedulerError::Gateway(_) => {
            error_response(&e.to_string(), "gateway", StatusCode::BAD_GATEWAY)
        }
    }
}

fn not_found(what: &str) -> Response {
    error_response(&format!("{what} not found"), "not_found", StatusCode::NOT_FOUND)
}

// ── Pods ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreatePodRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// GET /api/v1/pods
pub async fn list_pods(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_pods() {
        Ok(pods) => ApiResponse::ok(pods).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/pods
pub async fn create_pod(
    State(state): State<ApiState>,
    Json(req): Json<CreatePodRequest>,
) -> impl IntoResponse {
    match state.store.create_pod(&req.name, &req.description) {
        Ok(pod) => (StatusCode::CREATED, ApiResponse::ok(pod)).into_response(),
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/pods/{id}
pub async fn delete_pod(State(state): State<ApiState>, Path(id): Path<PodId>) -> impl IntoResponse {
    match state.store.delete_pod(id) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => not_found("pod"),
        Err(e) => state_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    /// Cores the group may hold on the pod's public hosts. Defaults to the
    /// configured `default_public_core_quota`.
    #[serde(default)]
    pub core_quota: Option<u32>,
}

/// PUT /api/v1/pods/{pod}/groups/{group}
pub async fn authorize_group(
    State(state): State<ApiState>,
    Path((pod_id, group_id)): Path<(PodId, GroupId)>,
    Json(req): Json<AuthorizeRequest>,
) -> impl IntoResponse {
    let quota = req
        .core_quota
        .unwrap_or(state.placement.config().default_public_core_quota);
    match state.store.authorize_group(pod_id, group_id, quota) {
        Ok(grant) => ApiResponse::ok(grant).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/pods/{pod}/assign/{group}
pub async fn assign_pod(
    State(state): State<ApiState>,
    Path((pod_id, group_id)): Path<(PodId, GroupId)>,
) -> impl IntoResponse {
    match state.store.assign_pod(group_id, pod_id) {
        Ok(hosts) => ApiResponse::ok(hosts).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Groups ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_groups() {
        Ok(groups) => ApiResponse::ok(groups).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/groups
pub async fn create_group(
    State(state): State<ApiState>,
    Json(req): Json<CreateGroupRequest>,
) -> impl IntoResponse {
    match state.store.create_group(&req.name, &req.description) {
        Ok(group) => (StatusCode::CREATED, ApiResponse::ok(group)).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Hosts ──────────────────────────────────────────────────────

/// A host together with its core and port occupancy.
#[derive(Debug, Serialize)]
pub struct HostDetail {
    pub host: Host,
    pub inventory: HostInventory,
}

/// POST /api/v1/hosts
pub async fn create_host(
    State(state): State<ApiState>,
    Json(req): Json<NewHost>,
) -> impl IntoResponse {
    let ports = state.placement.config().port_numbers();
    match state.store.create_host(&req, ports) {
        Ok(host) => (StatusCode::CREATED, ApiResponse::ok(host)).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/hosts/{id}
pub async fn get_host(State(state): State<ApiState>, Path(id): Path<HostId>) -> impl IntoResponse {
    let host = match state.store.get_host(id) {
        Ok(Some(host)) => host,
        Ok(None) => return not_found("host"),
        Err(e) => return state_error(&e),
    };
    match state.store.get_inventory(id) {
        Ok(Some(inventory)) => ApiResponse::ok(HostDetail { host, inventory }).into_response(),
        Ok(None) => not_found("host inventory"),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/hosts/{id}/assign/{group}
pub async fn assign_host(
    State(state): State<ApiState>,
    Path((host_id, group_id)): Path<(HostId, GroupId)>,
) -> impl IntoResponse {
    match state.store.assign_host(group_id, host_id) {
        Ok(host) => ApiResponse::ok(host).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/hosts/{id}/publish
pub async fn publish_host(
    State(state): State<ApiState>,
    Path(id): Path<HostId>,
) -> impl IntoResponse {
    match state.store.publish_host(id) {
        Ok(host) => ApiResponse::ok(host).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Apps / Versions ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterAppRequest {
    pub name: String,
    pub git: String,
    pub group_id: GroupId,
}

/// POST /api/v1/apps
pub async fn register_app(
    State(state): State<ApiState>,
    Json(req): Json<RegisterAppRequest>,
) -> impl IntoResponse {
    match state.store.get_or_create_app(&req.name, &req.git, req.group_id) {
        Ok(app) => ApiResponse::ok(app).into_response(),
        Err(e) => state_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AddVersionRequest {
    pub sha: String,
    pub config: AppConfig,
}

/// POST /api/v1/apps/{id}/versions
pub async fn add_version(
    State(state): State<ApiState>,
    Path(app_id): Path<AppId>,
    Json(req): Json<AddVersionRequest>,
) -> impl IntoResponse {
    match state.store.add_version(app_id, &req.sha, req.config) {
        Ok(version) => (StatusCode::CREATED, ApiResponse::ok(version)).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Placement ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CapacityQuery {
    pub group: GroupId,
    pub pod: PodId,
    pub cores: u32,
}

/// GET /api/v1/capacity?group=&pod=&cores=
pub async fn capacity(
    State(state): State<ApiState>,
    Query(q): Query<CapacityQuery>,
) -> impl IntoResponse {
    match state.placement.allocator().max_containers(q.group, q.pod, q.cores) {
        Ok(n) => ApiResponse::ok(serde_json::json!({
            "group": q.group,
            "pod": q.pod,
            "cores_per_container": q.cores,
            "max_containers": n,
        }))
        .into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/placements
pub async fn place(
    State(state): State<ApiState>,
    Json(req): Json<PlacementRequest>,
) -> impl IntoResponse {
    match state.placement.place(&req).await {
        Ok(placed) => (StatusCode::CREATED, ApiResponse::ok(placed)).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// GET /api/v1/containers/{id}
pub async fn get_container(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_container(&id) {
        Ok(Some(container)) => ApiResponse::ok(container).into_response(),
        Ok(None) => not_found("container"),
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/containers/{id}
pub async fn remove_container(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.placement.remove(&id).await {
        Ok(container) => ApiResponse::ok(container).into_response(),
        Err(e) => scheduler_error(&e),
    }
}
