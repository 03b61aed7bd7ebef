//! API Router configuration

use super::auth::require_auth;
use super::handlers;
use super::state::AppState;
use super::ws;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let public_routes = Router::new()
        // Health and status
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::daemon_status));

    let protected_routes = Router::new()
        // Experiments
        .route(
            "/experiments",
            get(handlers::list_experiments).post(handlers::create_experiment),
        )
        .route(
            "/experiments/:exp",
            get(handlers::get_experiment).delete(handlers::delete_experiment),
        )
        .route("/experiments/:exp/start", post(handlers::start_experiment))
        .route("/experiments/:exp/stop", post(handlers::stop_experiment))
        .route(
            "/experiments/:exp/schedule",
            get(handlers::get_schedule).post(handlers::schedule_experiment),
        )
        .route("/experiments/:exp/captures", get(handlers::list_captures))
        .route("/experiments/:exp/files", get(handlers::list_files))
        .route(
            "/experiments/:exp/files/:filename",
            get(handlers::get_file),
        )
        // VMs
        .route("/experiments/:exp/vms", get(handlers::list_vms))
        .route(
            "/experiments/:exp/vms/:name",
            get(handlers::get_vm)
                .patch(handlers::update_vm)
                .delete(handlers::delete_vm),
        )
        .route("/experiments/:exp/vms/:name/start", post(handlers::start_vm))
        .route("/experiments/:exp/vms/:name/stop", post(handlers::stop_vm))
        .route(
            "/experiments/:exp/vms/:name/redeploy",
            post(handlers::redeploy_vm),
        )
        .route(
            "/experiments/:exp/vms/:name/captures",
            get(handlers::list_vm_captures)
                .post(handlers::start_capture)
                .delete(handlers::stop_captures),
        )
        .route(
            "/experiments/:exp/vms/:name/snapshots",
            get(handlers::list_snapshots).post(handlers::snapshot_vm),
        )
        .route(
            "/experiments/:exp/vms/:name/snapshots/:snapshot",
            post(handlers::restore_vm),
        )
        .route("/experiments/:exp/vms/:name/commit", post(handlers::commit_vm))
        .route(
            "/experiments/:exp/vms/:name/screenshot.png",
            get(handlers::screenshot),
        )
        .route("/vms", get(handlers::list_all_vms))
        // Cluster
        .route("/topologies", get(handlers::list_topologies))
        .route(
            "/topologies/:topology/scenarios",
            get(handlers::list_scenarios),
        )
        .route("/disks", get(handlers::list_disks))
        .route("/hosts", get(handlers::list_hosts))
        // Users
        .route(
            "/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route(
            "/users/:username",
            get(handlers::get_user)
                .patch(handlers::update_user)
                .delete(handlers::delete_user),
        )
        // Live notifications
        .route("/ws", get(ws::subscribe))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let router = Router::new()
        .nest("/api/v1", public_routes.merge(protected_routes))
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}
