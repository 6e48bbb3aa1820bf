use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use dashmap::DashSet;
use serde_json::json;
use shared::telemetry;
use shared::{ConnectionStore, PerformanceMonitor};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::executor::SyncExecutor;
use crate::history::HistorySync;
use crate::migration::MigrationManager;
use crate::models::PushEnvelope;
use crate::watch::{WatchManager, WatchSetupResult};

#[derive(Clone)]
pub struct ApiState {
    pub connections: Arc<dyn ConnectionStore>,
    pub history: HistorySync,
    pub executor: SyncExecutor,
    pub watches: WatchManager,
    pub migration: MigrationManager,
    pub monitor: PerformanceMonitor,
    pub active_syncs: Arc<DashSet<String>>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        // Pub/Sub push endpoint
        .route("/notifications", post(handle_notification))
        // Admin endpoints
        .route("/connections/:id/sync", post(trigger_sync))
        .route(
            "/connections/:id/watch",
            post(setup_watch).delete(stop_watch),
        )
        .route("/watches/expiring", get(expiring_watches))
        .route("/watches/:id/renew", post(renew_watch))
        .route("/migration", post(migrate_all).delete(rollback_migration))
        .route("/migration/status", get(migration_status))
        .route("/migration/:connection_id", post(migrate_connection))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(telemetry::middleware::trace_layer))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "gmail-connector"
    }))
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.monitor.snapshot())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn watch_response(result: WatchSetupResult) -> Response {
    let status = if result.success {
        StatusCode::OK
    } else if result.reauth_required {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(result)).into_response()
}

/// Always acknowledges decodable deliveries so Pub/Sub does not redeliver;
/// the sync itself runs in the background.
async fn handle_notification(
    State(state): State<ApiState>,
    Json(envelope): Json<PushEnvelope>,
) -> Response {
    let notification = match envelope.decode() {
        Ok(notification) => notification,
        Err(e) => {
            warn!("Rejecting malformed push notification: {}", e);
            return error_response(StatusCode::BAD_REQUEST, e);
        }
    };
    debug!(
        "Push notification for {} at history {}",
        notification.email_address, notification.history_id
    );

    let connection = match state
        .connections
        .find_by_email(&notification.email_address)
        .await
    {
        Ok(Some(connection)) => connection,
        Ok(None) => {
            warn!(
                "Ignoring notification for unknown mailbox {}",
                notification.email_address
            );
            return (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response();
        }
        Err(e) => {
            error!("Failed to resolve mailbox for notification: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    if !state.active_syncs.insert(connection.id.clone()) {
        debug!(
            "Sync already running for {}, dropping notification",
            connection.id
        );
        return (StatusCode::OK, Json(json!({ "status": "in_progress" }))).into_response();
    }

    let history = state.history.clone();
    let active_syncs = Arc::clone(&state.active_syncs);
    let connection_id = connection.id.clone();
    tokio::spawn(async move {
        let result = history
            .handle_notification(&notification.email_address, &notification.history_id)
            .await;
        active_syncs.remove(&connection_id);

        if !result.success {
            error!(
                "Notification sync for {} failed: {}",
                connection_id,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
}

async fn trigger_sync(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let connection = match state.connections.find_by_id(&id).await {
        Ok(Some(connection)) => connection,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Connection not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    if !state.active_syncs.insert(id.clone()) {
        return error_response(
            StatusCode::CONFLICT,
            "Sync already in progress for this connection",
        );
    }

    info!("Manual sync triggered for connection {}", id);
    let result = state.executor.execute_auto_sync(&connection).await;
    state.active_syncs.remove(&id);

    let status = if result.success {
        StatusCode::OK
    } else if result.reauth_required {
        StatusCode::UNAUTHORIZED
    } else if result.retry_after.is_some() {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(result)).into_response()
}

async fn setup_watch(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    info!("Setting up watch for connection {}", id);
    watch_response(state.watches.setup_watch(&id).await)
}

async fn stop_watch(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    info!("Stopping watch for connection {}", id);
    let result = state.watches.stop_watch(&id).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(result)).into_response()
}

async fn renew_watch(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    info!("Renewing watch {}", id);
    watch_response(state.watches.renew_watch(&id).await)
}

async fn expiring_watches(State(state): State<ApiState>) -> Response {
    match state.watches.find_expiring_soon().await {
        Ok(expiring) => Json(expiring).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn migrate_all(State(state): State<ApiState>) -> Response {
    let result = state.migration.migrate_all_connections().await;
    let status = if result.load_error.is_some() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else if result.success {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(result)).into_response()
}

async fn rollback_migration(State(state): State<ApiState>) -> Response {
    let result = state.migration.rollback_migration().await;
    let status = if result.load_error.is_some() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else if result.success {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(result)).into_response()
}

async fn migration_status(State(state): State<ApiState>) -> Response {
    match state.migration.get_migration_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn migrate_connection(
    State(state): State<ApiState>,
    Path(connection_id): Path<String>,
) -> Response {
    watch_response(state.migration.migrate_connection(&connection_id).await)
}
