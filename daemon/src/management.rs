//! Management API for the imserver daemon
//!
//! Provides administration endpoints for:
//! - Online statistics
//! - Listing connected users
//! - Disconnecting a user
//! - Pushing a message to a user

use crate::router::{Delivery, MessageRouter, RouteError};
use anyhow::Result;
use axum::{
    Router,
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
struct AppState {
    router: Arc<MessageRouter>,
}

/// Push request body
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub to_user_id: String,
    pub message: String,
}

/// Push outcome
#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub status: &'static str,
    pub detail: Option<String>,
}

/// System statistics
#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub online_count: usize,
    pub connections: usize,
}

/// Build the management router
pub fn app(router: Arc<MessageRouter>) -> Router {
    Router::new()
        .route("/admin/stats", get(get_stats))
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id", delete(kick_user))
        .route("/admin/push", post(push))
        .with_state(AppState { router })
}

/// Start the Management API server
pub async fn start_server(bind: SocketAddr, router: Arc<MessageRouter>) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("Management API listening on {}", bind);
    axum::serve(listener, app(router)).await?;

    Ok(())
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.router.registry();
    let stats = SystemStats {
        online_count: registry.online_count(),
        connections: registry.len(),
    };
    (StatusCode::OK, Json(stats))
}

async fn list_users(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.router.registry().user_ids())
}

/// Drop a user from the registry and end their connection task
async fn kick_user(State(state): State<AppState>, Path(user_id): Path<String>) -> StatusCode {
    match state.router.registry().unregister(&user_id) {
        Some(handle) => {
            info!("Kicked user {} (conn {})", user_id, handle.conn_id);
            handle.disconnect();
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn push(
    State(state): State<AppState>,
    Json(payload): Json<PushRequest>,
) -> impl IntoResponse {
    info!("Admin push to {}", payload.to_user_id);
    let result = state
        .router
        .push_external(&payload.to_user_id, payload.message)
        .await;

    let (code, status) = match &result {
        Ok(Delivery::Delivered) => (StatusCode::OK, "delivered"),
        Ok(Delivery::Skipped) => (StatusCode::OK, "skipped"),
        Err(RouteError::RecipientOffline(_)) => (StatusCode::NOT_FOUND, "offline"),
        Err(RouteError::DeliveryFailed { .. }) => (StatusCode::BAD_GATEWAY, "failed"),
        Err(RouteError::Malformed { .. }) => (StatusCode::BAD_REQUEST, "malformed"),
    };

    let response = PushResponse {
        status,
        detail: result.err().map(|e| e.to_string()),
    };
    (code, Json(response))
}
