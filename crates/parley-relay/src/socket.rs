//! WebSocket endpoint: connection lifecycle and event forwarding.
//!
//! Each connection registers under the user id it presents in the query
//! string, receives the online-user broadcast, and then relays named
//! events until the transport closes. A dead transport without a clean
//! close is handled the same way: the read half ends and the connection
//! deregisters itself.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::events::{ClientEvent, ServerEvent};
use parley_shared::types::UserId;

use crate::api::AppState;
use crate::registry::ConnId;
use crate::router::route_client_event;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: Option<String>,
}

/// WebSocket upgrade handler for `GET /ws?user_id=`.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = match query.user_id {
        Some(id) if !id.is_empty() => UserId::new(id),
        _ => {
            return (StatusCode::BAD_REQUEST, "missing user_id").into_response();
        }
    };

    let max = state.config.max_connections;
    if max > 0 && state.registry.connection_count() >= max {
        warn!(user = %user_id.short(), "Connection rejected: server full");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let conn_id = ConnId::new();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    info!(user = %user_id.short(), "User connected");

    state.registry.register(user_id.clone(), conn_id, tx);
    state.registry.broadcast(ServerEvent::OnlineUsers {
        users: state.registry.online_users(),
    });

    // Forward queued server events to this connection as JSON text frames.
    let forward_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize server event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Receive loop: parse and route client events.
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientEvent::from_json(&text) {
                Ok(event) => {
                    route_client_event(&state.registry, &user_id, event);
                }
                Err(e) => {
                    debug!(user = %user_id.short(), error = %e, "Ignoring malformed event");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Binary(_)) => {
                debug!(user = %user_id.short(), "Ignoring binary frame");
            }
            Err(e) => {
                debug!(user = %user_id.short(), error = %e, "WebSocket error");
                break;
            }
        }
    }

    forward_task.abort();

    // Only broadcast an updated presence set if this connection still owned
    // the registry entry; a reconnect may already have replaced it.
    if state.registry.deregister(&user_id, conn_id) {
        info!(user = %user_id.short(), "User disconnected");
        state.registry.broadcast(ServerEvent::OnlineUsers {
            users: state.registry.online_users(),
        });
    } else {
        debug!(user = %user_id.short(), "Superseded connection closed");
    }
}
