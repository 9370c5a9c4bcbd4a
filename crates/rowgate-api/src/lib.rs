//! rowgate-api: HTTP/JSON surface of the entity server.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/sessions` | Connect a client |
//! | GET | `/api/v1/sessions/{id}` | Connection state |
//! | DELETE | `/api/v1/sessions/{id}` | Disconnect |
//! | POST | `/api/v1/sessions/{id}/call` | Invoke an operation |
//! | GET | `/api/v1/admin/status` | Counts, rates and timeouts |
//! | PUT | `/api/v1/admin/settings` | Update server settings |
//! | GET | `/api/v1/admin/clients` | List clients (`user`, `client_type` filters) |
//! | DELETE | `/api/v1/admin/clients` | Remove connections (`inactive_only`: timed out, idle ones) |
//! | DELETE | `/api/v1/admin/clients/{id}` | Disconnect one client |
//! | GET | `/api/v1/admin/client-types` | Client types in use |
//! | GET | `/api/v1/admin/clients/{id}/log` | Client call log |
//! | PUT | `/api/v1/admin/clients/{id}/logging` | Toggle client logging |
//! | GET | `/api/v1/admin/pools` | Pooled usernames |
//! | GET | `/api/v1/admin/pools/{user}` | Pool settings |
//! | PUT | `/api/v1/admin/pools/{user}` | Tune a pool |
//! | GET | `/api/v1/admin/pools/{user}/statistics` | Pool statistics (`since`) |
//! | GET | `/api/v1/admin/log-level` | Current log filter |
//! | PUT | `/api/v1/admin/log-level` | Replace the log filter |
//! | POST | `/api/v1/admin/shutdown` | Shut the server down |
//!
//! Admin routes authenticate with the `x-admin-username` and
//! `x-admin-password` headers.

pub mod admin_handlers;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use rowgate_server::EntityServer;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub server: Arc<EntityServer>,
}

/// Build the complete API router.
pub fn build_router(server: Arc<EntityServer>) -> Router {
    let state = ApiState { server };

    let session_routes = Router::new()
        .route("/sessions", post(handlers::connect))
        .route(
            "/sessions/{id}",
            get(handlers::session_state).delete(handlers::disconnect),
        )
        .route("/sessions/{id}/call", post(handlers::call));

    let admin_routes = Router::new()
        .route("/status", get(admin_handlers::status))
        .route("/settings", put(admin_handlers::update_settings))
        .route(
            "/clients",
            get(admin_handlers::list_clients).delete(admin_handlers::remove_connections),
        )
        .route("/clients/{id}", delete(admin_handlers::disconnect_client))
        .route("/clients/{id}/log", get(admin_handlers::client_log))
        .route("/clients/{id}/logging", put(admin_handlers::set_logging))
        .route("/client-types", get(admin_handlers::client_types))
        .route(
            "/log-level",
            get(admin_handlers::log_level).put(admin_handlers::set_log_level),
        )
        .route("/pools", get(admin_handlers::list_pools))
        .route(
            "/pools/{user}",
            get(admin_handlers::pool_settings).put(admin_handlers::tune_pool),
        )
        .route("/pools/{user}/statistics", get(admin_handlers::pool_statistics))
        .route("/shutdown", post(admin_handlers::shutdown));

    Router::new()
        .nest("/api/v1", session_routes.nest("/admin", admin_routes))
        .with_state(state)
}
