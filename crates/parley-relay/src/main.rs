//! # parley-relay
//!
//! Signaling relay for the Parley chat system.
//!
//! This binary provides:
//! - **WebSocket endpoint** (`/ws?user_id=`) over which clients exchange
//!   typing indicators and WebRTC signaling events
//! - **Presence broadcast**: the full online-user set is pushed to every
//!   client on each connect/disconnect
//! - **Internal emit endpoint** so the message-store service can push
//!   store events (new message, seen, delete) to a user's socket
//!
//! The relay performs pure routing: it never interprets signaling
//! payloads, never queues for offline users, and never reports a failed
//! delivery back to the sender.

mod api;
mod config;
mod error;
mod registry;
mod router;
mod socket;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::RelayConfig;
use crate::registry::ConnectionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_relay=debug")),
        )
        .init();

    info!("Starting Parley relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();
    info!(
        instance = %config.instance_name,
        addr = %config.listen_addr,
        max_connections = config.max_connections,
        internal_emit = config.internal_token.is_some(),
        "Loaded configuration"
    );

    let state = AppState {
        registry: Arc::new(ConnectionRegistry::new()),
        config: Arc::new(config.clone()),
    };

    let router = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!(addr = %config.listen_addr, "Relay listening");

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Server failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
