//! Socket event loop with tokio mpsc command/notification pattern.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use parley_shared::constants::SOCKET_CHANNEL_CAPACITY;
use parley_shared::events::{ClientEvent, ServerEvent};
use parley_shared::types::UserId;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Invalid relay URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("WebSocket connect failed: {0}")]
    Connect(String),
}

/// Commands sent *into* the socket task.
#[derive(Debug)]
pub enum SocketCommand {
    /// Emit an event to the relay.
    Emit(ClientEvent),
    /// Close the connection and end the task.
    Shutdown,
}

/// Notifications sent *from* the socket task to the application.
#[derive(Debug, Clone)]
pub enum SocketNotification {
    /// A server event arrived.
    Event(ServerEvent),
    /// The connection closed (cleanly or not). Terminal for this task;
    /// reconnecting means calling [`spawn_socket`] again.
    Disconnected,
}

/// Configuration for the socket connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Relay WebSocket endpoint, e.g. `ws://localhost:5002/ws`.
    pub relay_url: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:5002/ws".to_string(),
        }
    }
}

/// Connect to the relay and spawn the socket event loop in a background
/// tokio task.
///
/// Returns channels for sending commands and receiving notifications.
pub async fn spawn_socket(
    config: SocketConfig,
    user_id: UserId,
) -> Result<
    (
        mpsc::Sender<SocketCommand>,
        mpsc::Receiver<SocketNotification>,
    ),
    SocketError,
> {
    let mut url = Url::parse(&config.relay_url).map_err(|e| SocketError::InvalidUrl {
        url: config.relay_url.clone(),
        reason: e.to_string(),
    })?;
    url.query_pairs_mut()
        .append_pair("user_id", user_id.as_str());

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| SocketError::Connect(e.to_string()))?;

    info!(user = %user_id.short(), url = %url, "Socket connected");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SocketCommand>(SOCKET_CHANNEL_CAPACITY);
    let (notif_tx, notif_rx) = mpsc::channel::<SocketNotification>(SOCKET_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                // --- Outgoing commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SocketCommand::Emit(event)) => {
                            let frame = match event.to_json() {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!(error = %e, "Failed to serialize client event");
                                    continue;
                                }
                            };
                            if ws_sender.send(Message::Text(frame)).await.is_err() {
                                warn!("Socket send failed, closing");
                                break;
                            }
                        }
                        Some(SocketCommand::Shutdown) => {
                            info!("Socket shutdown requested");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        None => {
                            // All senders dropped
                            debug!("Command channel closed, shutting down socket");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }

                // --- Incoming frames ---
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match ServerEvent::from_json(&text) {
                                Ok(event) => {
                                    let _ = notif_tx
                                        .send(SocketNotification::Event(event))
                                        .await;
                                }
                                Err(e) => {
                                    debug!(error = %e, "Ignoring malformed server event");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Socket closed by remote");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Socket error");
                            break;
                        }
                    }
                }
            }
        }

        let _ = notif_tx.send(SocketNotification::Disconnected).await;
        info!("Socket event loop terminated");
    });

    Ok((cmd_tx, notif_rx))
}
