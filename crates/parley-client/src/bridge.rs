//! Event pump: socket notifications and media events into the state
//! layers.
//!
//! Runs until the socket disconnects, then hands the state back so the
//! application can reconnect and resume.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_net::SocketNotification;
use parley_shared::events::ServerEvent;
use parley_store::MessageStore;

use crate::call::CallController;
use crate::chat::ChatState;

fn is_call_signal(event: &ServerEvent) -> bool {
    matches!(
        event,
        ServerEvent::CallInvitation { .. }
            | ServerEvent::Offer { .. }
            | ServerEvent::Answer { .. }
            | ServerEvent::Candidate { .. }
            | ServerEvent::CallAccept
            | ServerEvent::CallDecline
            | ServerEvent::CallEnded
    )
}

/// Pump events into the chat and call layers until the socket closes.
///
/// Returns the state layers so a reconnecting caller keeps its data.
pub async fn run_bridge<S: MessageStore>(
    mut chat: ChatState<S>,
    mut calls: CallController,
    mut notif_rx: mpsc::Receiver<SocketNotification>,
) -> (ChatState<S>, CallController) {
    let mut media_events = calls
        .take_media_events()
        .expect("media events already taken");
    let mut timer_events = calls
        .take_timer_events()
        .expect("timer events already taken");

    info!("Client bridge started");

    loop {
        tokio::select! {
            notification = notif_rx.recv() => {
                match notification {
                    Some(SocketNotification::Event(event)) => {
                        if is_call_signal(&event) {
                            if let Err(e) = calls.handle_signal(event).await {
                                warn!(error = %e, "Signal handling failed");
                            }
                        } else if let Err(e) = chat.apply_server_event(event).await {
                            warn!(error = %e, "Event application failed");
                        }
                    }
                    Some(SocketNotification::Disconnected) | None => {
                        info!("Socket disconnected, stopping bridge");
                        break;
                    }
                }
            }

            event = media_events.recv() => {
                match event {
                    Some(event) => {
                        debug!(event = ?event, "Media event");
                        if let Err(e) = calls.handle_media_event(event).await {
                            warn!(error = %e, "Media event handling failed");
                        }
                    }
                    None => {
                        warn!("Media event channel closed");
                        break;
                    }
                }
            }

            fired = timer_events.recv() => {
                if let Some(fired) = fired {
                    calls.handle_ring_timeout(fired).await;
                }
            }
        }
    }

    // A live call does not outlast its signaling channel.
    if let Err(e) = calls.hangup().await {
        warn!(error = %e, "Hangup on disconnect failed");
    }

    (chat, calls)
}
