use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::events::ServerEvent;
use parley_shared::types::UserId;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::ConnectionRegistry;
use crate::socket::handle_websocket;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub config: Arc<RelayConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(handle_websocket))
        .route("/internal/emit/:user_id", post(internal_emit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online: usize,
}

#[derive(Serialize)]
struct EmitResponse {
    delivered: bool,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online: state.registry.connection_count(),
    })
}

/// Push endpoint for the message-store service.
///
/// The store calls this after a mutation (new message, seen flip, delete)
/// to reach the affected user's socket. Delivery keeps relay semantics:
/// offline target means the event is dropped, and `delivered: false` is
/// informational only — the store does not retry.
async fn internal_emit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(event): Json<ServerEvent>,
) -> Result<Json<EmitResponse>, RelayError> {
    authorize_internal(&state.config, &headers)?;

    let target = UserId::new(user_id);
    let delivered = state.registry.emit_to(&target, event);

    info!(user = %target.short(), delivered, "Internal emit");

    Ok(Json(EmitResponse { delivered }))
}

fn authorize_internal(config: &RelayConfig, headers: &HeaderMap) -> Result<(), RelayError> {
    let expected = match &config.internal_token {
        Some(token) => token,
        None => return Err(RelayError::Unauthorized),
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(RelayError::Unauthorized),
    }
}
