//! corral-api — REST API for Corral.
//!
//! Provides axum route handlers for managing pods, groups, hosts, apps and
//! container placements. Every response uses the same JSON envelope:
//! `{"success": bool, "data": ..., "error": "...", "kind": "..."}`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/pods` | List pods |
//! | POST | `/api/v1/pods` | Create a pod |
//! | DELETE | `/api/v1/pods/{id}` | Delete a pod without hosts |
//! | PUT | `/api/v1/pods/{pod}/groups/{group}` | Authorize a group on the public pool |
//! | POST | `/api/v1/pods/{pod}/assign/{group}` | Make the pod's free hosts private to a group |
//! | GET | `/api/v1/groups` | List groups |
//! | POST | `/api/v1/groups` | Create a group |
//! | POST | `/api/v1/hosts` | Register a host |
//! | GET | `/api/v1/hosts/{id}` | Host with its core/port inventory |
//! | POST | `/api/v1/hosts/{id}/assign/{group}` | Make a host private to a group |
//! | POST | `/api/v1/hosts/{id}/publish` | Move a host into the public pool |
//! | POST | `/api/v1/apps` | Register an app (or return the existing one) |
//! | POST | `/api/v1/apps/{id}/versions` | Add a version |
//! | GET | `/api/v1/capacity` | How many containers fit (`group`, `pod`, `cores`) |
//! | POST | `/api/v1/placements` | Place containers |
//! | GET | `/api/v1/containers/{id}` | Container details |
//! | DELETE | `/api/v1/containers/{id}` | Remove a container |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post, put};
use corral_scheduler::PlacementService;
use corral_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub placement: PlacementService,
}

impl ApiState {
    pub fn new(placement: PlacementService) -> Self {
        Self {
            store: placement.store().clone(),
            placement,
        }
    }
}

/// Build the complete API router.
pub fn build_router(placement: PlacementService) -> Router {
    let api_routes = Router::new()
        .route("/pods", get(handlers::list_pods).post(handlers::create_pod))
        .route("/pods/{id}", axum::routing::delete(handlers::delete_pod))
        .route("/pods/{pod}/groups/{group}", put(handlers::authorize_group))
        .route("/pods/{pod}/assign/{group}", post(handlers::assign_pod))
        .route("/groups", get(handlers::list_groups).post(handlers::create_group))
        .route("/hosts", post(handlers::create_host))
        .route("/hosts/{id}", get(handlers::get_host))
        .route("/hosts/{id}/assign/{group}", post(handlers::assign_host))
        .route("/hosts/{id}/publish", post(handlers::publish_host))
        .route("/apps", post(handlers::register_app))
        .route("/apps/{id}/versions", post(handlers::add_version))
        .route("/capacity", get(handlers::capacity))
        .route("/placements", post(handlers::place))
        .route(
            "/containers/{id}",
            get(handlers::get_container).delete(handlers::remove_container),
        )
        .with_state(ApiState::new(placement));

    Router::new().nest("/api/v1", api_routes)
}
