//! Admin handlers.
//!
//! Each handler first resolves a `ServerAdmin` from the
//! `x-admin-username`/`x-admin-password` headers.

use std::collections::HashMap;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use rowgate_core::User;
use rowgate_server::{ServerAdmin, ServerInfo};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, server_error};

pub const ADMIN_USERNAME_HEADER: &str = "x-admin-username";
pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<ServerAdmin, Response> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let (Some(username), Some(password)) = (
        header(ADMIN_USERNAME_HEADER),
        header(ADMIN_PASSWORD_HEADER),
    ) else {
        return Err(error_response(
            "admin credentials required",
            "authentication",
            StatusCode::UNAUTHORIZED,
        ));
    };
    state
        .server
        .admin(&User::new(username, password))
        .map_err(|e| server_error(&e))
}

macro_rules! admin_or_return {
    ($state:expr, $headers:expr) => {
        match authorize(&$state, &$headers) {
            Ok(admin) => admin,
            Err(response) => return response,
        }
    };
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

// ── Status & settings ──────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusView {
    pub server: ServerInfo,
    pub active_connection_count: usize,
    pub requests_per_second: f64,
    pub warning_time_exceeded_per_second: f64,
    pub warning_threshold_ms: u64,
    pub connection_timeout_ms: u64,
    pub maintenance_interval_ms: u64,
    pub client_type_timeouts_ms: HashMap<String, u64>,
}

async fn status_view(admin: &ServerAdmin) -> StatusView {
    StatusView {
        server: admin.server_info().await,
        active_connection_count: admin.active_connection_count(),
        requests_per_second: admin.requests_per_second(),
        warning_time_exceeded_per_second: admin.warning_time_exceeded_per_second(),
        warning_threshold_ms: millis(admin.warning_threshold()),
        connection_timeout_ms: millis(admin.connection_timeout()),
        maintenance_interval_ms: millis(admin.maintenance_interval()),
        client_type_timeouts_ms: admin
            .client_type_timeouts()
            .into_iter()
            .map(|(client_type, timeout)| (client_type, millis(timeout)))
            .collect(),
    }
}

/// GET /api/v1/admin/status
pub async fn status(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let admin = admin_or_return!(state, headers);
    ApiResponse::ok(status_view(&admin).await).into_response()
}

/// Settings update body. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub connection_timeout_ms: Option<u64>,
    pub warning_threshold_ms: Option<u64>,
    pub maintenance_interval_ms: Option<u64>,
    /// `0` removes the limit.
    pub connection_limit: Option<usize>,
    /// Per client type overrides; `0` removes an override.
    #[serde(default)]
    pub client_type_timeouts_ms: HashMap<String, u64>,
}

/// PUT /api/v1/admin/settings
pub async fn update_settings(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    if let Some(ms) = update.maintenance_interval_ms {
        if let Err(e) = admin.set_maintenance_interval(Duration::from_millis(ms)) {
            return server_error(&e);
        }
    }
    if let Some(ms) = update.connection_timeout_ms {
        admin.set_connection_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = update.warning_threshold_ms {
        admin.set_warning_threshold(Duration::from_millis(ms));
    }
    if let Some(limit) = update.connection_limit {
        admin.set_connection_limit((limit > 0).then_some(limit));
    }
    for (client_type, ms) in &update.client_type_timeouts_ms {
        admin.set_client_type_timeout(client_type, (*ms > 0).then(|| Duration::from_millis(*ms)));
    }
    info!(?update, "server settings updated");
    ApiResponse::ok(status_view(&admin).await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogLevelUpdate {
    /// `EnvFilter` directives, e.g. `info,rowgate=debug`.
    pub level: String,
}

/// GET /api/v1/admin/log-level
pub async fn log_level(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let admin = admin_or_return!(state, headers);
    match admin.log_level() {
        Ok(level) => ApiResponse::ok(serde_json::json!({ "level": level })).into_response(),
        Err(e) => server_error(&e),
    }
}

/// PUT /api/v1/admin/log-level
pub async fn set_log_level(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(update): Json<LogLevelUpdate>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    match admin.set_log_level(&update.level) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "level": update.level })).into_response(),
        Err(e) => server_error(&e),
    }
}

/// POST /api/v1/admin/shutdown
pub async fn shutdown(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let admin = admin_or_return!(state, headers);
    admin.shutdown().await;
    ApiResponse::ok("shut down").into_response()
}

// ── Clients ────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ClientFilter {
    pub user: Option<String>,
    pub client_type: Option<String>,
}

/// GET /api/v1/admin/clients
pub async fn list_clients(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(filter): Query<ClientFilter>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    let clients = match (&filter.user, &filter.client_type) {
        (Some(user), None) => admin.clients_of_user(user),
        (None, Some(client_type)) => admin.clients_of_type(client_type),
        (Some(user), Some(client_type)) => admin
            .clients_of_user(user)
            .into_iter()
            .filter(|client| &client.client_type == client_type)
            .collect(),
        (None, None) => admin.clients(),
    };
    ApiResponse::ok(clients).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub inactive_only: bool,
}

/// DELETE /api/v1/admin/clients
pub async fn remove_connections(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<RemoveQuery>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    let removed = admin.remove_connections(query.inactive_only).await;
    ApiResponse::ok(serde_json::json!({ "removed": removed })).into_response()
}

/// DELETE /api/v1/admin/clients/{id}
pub async fn disconnect_client(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    if admin.disconnect(id).await {
        ApiResponse::ok(serde_json::json!({ "client_id": id, "disconnected": true }))
            .into_response()
    } else {
        server_error(&rowgate_server::ServerError::ClientNotFound(id))
    }
}

/// GET /api/v1/admin/client-types
pub async fn client_types(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let admin = admin_or_return!(state, headers);
    ApiResponse::ok(admin.client_types()).into_response()
}

/// GET /api/v1/admin/clients/{id}/log
pub async fn client_log(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    match admin.server_log(id) {
        Ok(log) => ApiResponse::ok(log).into_response(),
        Err(e) => server_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingToggle {
    pub enabled: bool,
}

/// PUT /api/v1/admin/clients/{id}/logging
pub async fn set_logging(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(toggle): Json<LoggingToggle>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    match admin.set_logging_enabled(id, toggle.enabled) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "client_id": id, "enabled": toggle.enabled }))
            .into_response(),
        Err(e) => server_error(&e),
    }
}

// ── Pools ──────────────────────────────────────────────────────

/// GET /api/v1/admin/pools
pub async fn list_pools(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let admin = admin_or_return!(state, headers);
    ApiResponse::ok(admin.pool_users().await).into_response()
}

#[derive(Debug, Serialize)]
pub struct PoolView {
    pub username: String,
    pub enabled: bool,
    pub minimum_size: usize,
    pub maximum_size: usize,
    pub checkout_timeout_ms: u64,
    pub maximum_retry_wait_ms: u64,
    pub idle_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    pub collect_fine_grained: bool,
}

async fn pool_view(admin: &ServerAdmin, user: &str) -> rowgate_server::ServerResult<PoolView> {
    Ok(PoolView {
        username: user.to_string(),
        enabled: admin.pool_enabled(user).await?,
        minimum_size: admin.minimum_pool_size(user).await?,
        maximum_size: admin.maximum_pool_size(user).await?,
        checkout_timeout_ms: millis(admin.pool_checkout_timeout(user).await?),
        maximum_retry_wait_ms: millis(admin.maximum_retry_wait_period(user).await?),
        idle_timeout_ms: millis(admin.pool_idle_timeout(user).await?),
        cleanup_interval_ms: millis(admin.pool_cleanup_interval(user).await?),
        collect_fine_grained: admin.collect_fine_grained_statistics(user).await?,
    })
}

/// GET /api/v1/admin/pools/{user}
pub async fn pool_settings(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user): Path<String>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    match pool_view(&admin, &user).await {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => server_error(&e),
    }
}

/// Pool tuning body. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct PoolTuning {
    pub enabled: Option<bool>,
    pub minimum_size: Option<usize>,
    pub maximum_size: Option<usize>,
    pub checkout_timeout_ms: Option<u64>,
    pub maximum_retry_wait_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub collect_fine_grained: Option<bool>,
    #[serde(default)]
    pub reset_statistics: bool,
}

async fn apply_tuning(
    admin: &ServerAdmin,
    user: &str,
    tuning: &PoolTuning,
) -> rowgate_server::ServerResult<()> {
    // Grow the ceiling before raising the floor so a combined update
    // never passes through min > max.
    match (tuning.minimum_size, tuning.maximum_size) {
        (Some(min), Some(max)) if max >= admin.maximum_pool_size(user).await? => {
            admin.set_maximum_pool_size(user, max).await?;
            admin.set_minimum_pool_size(user, min).await?;
        }
        (min, max) => {
            if let Some(min) = min {
                admin.set_minimum_pool_size(user, min).await?;
            }
            if let Some(max) = max {
                admin.set_maximum_pool_size(user, max).await?;
            }
        }
    }
    if let Some(ms) = tuning.checkout_timeout_ms {
        admin
            .set_pool_checkout_timeout(user, Duration::from_millis(ms))
            .await?;
    }
    if let Some(ms) = tuning.maximum_retry_wait_ms {
        admin
            .set_maximum_retry_wait_period(user, Duration::from_millis(ms))
            .await?;
    }
    if let Some(ms) = tuning.idle_timeout_ms {
        admin
            .set_pool_idle_timeout(user, Duration::from_millis(ms))
            .await?;
    }
    if let Some(ms) = tuning.cleanup_interval_ms {
        admin
            .set_pool_cleanup_interval(user, Duration::from_millis(ms))
            .await?;
    }
    if let Some(collect) = tuning.collect_fine_grained {
        admin.set_collect_fine_grained_statistics(user, collect).await?;
    }
    if let Some(enabled) = tuning.enabled {
        admin.set_pool_enabled(user, enabled).await?;
    }
    if tuning.reset_statistics {
        admin.reset_pool_statistics(user).await?;
    }
    Ok(())
}

/// PUT /api/v1/admin/pools/{user}
pub async fn tune_pool(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user): Path<String>,
    Json(tuning): Json<PoolTuning>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    if let Err(e) = apply_tuning(&admin, &user, &tuning).await {
        return server_error(&e);
    }
    info!(user = %user, ?tuning, "pool tuned");
    match pool_view(&admin, &user).await {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => server_error(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatisticsQuery {
    #[serde(default)]
    pub since: u64,
}

/// GET /api/v1/admin/pools/{user}/statistics
pub async fn pool_statistics(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user): Path<String>,
    Query(query): Query<StatisticsQuery>,
) -> Response {
    let admin = admin_or_return!(state, headers);
    match admin.pool_statistics(&user, query.since).await {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => server_error(&e),
    }
}
