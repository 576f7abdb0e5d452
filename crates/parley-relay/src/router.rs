//! Event routing.
//!
//! Maps each inbound client event to its forwarded form and hands it to
//! the target's connection. Pure routing: payloads are never inspected,
//! offline targets are a silent drop, nothing is queued or retried.

use tracing::debug;

use parley_shared::events::{ClientEvent, ServerEvent};
use parley_shared::types::UserId;

use crate::registry::ConnectionRegistry;

/// Rewrite a client event into the form the target receives.
///
/// The attached sender and the dropped payloads follow the wire contract:
/// offers keep their payload and gain `from`; answers and candidates are
/// forwarded payload-only; accept/decline/call-ended carry nothing.
pub fn forwarded_event(sender: &UserId, event: ClientEvent) -> ServerEvent {
    match event {
        ClientEvent::Typing { .. } => ServerEvent::Typing {
            from: sender.clone(),
        },
        ClientEvent::StopTyping { .. } => ServerEvent::StopTyping {
            from: sender.clone(),
        },
        ClientEvent::CallInvitation { .. } => ServerEvent::CallInvitation {
            from: sender.clone(),
        },
        ClientEvent::Offer { offer, .. } => ServerEvent::Offer {
            from: sender.clone(),
            offer,
        },
        ClientEvent::Answer { answer, .. } => ServerEvent::Answer { answer },
        ClientEvent::Candidate { candidate, .. } => ServerEvent::Candidate { candidate },
        ClientEvent::Accept { .. } => ServerEvent::CallAccept,
        ClientEvent::Decline { .. } => ServerEvent::CallDecline,
        ClientEvent::CallEnded { .. } => ServerEvent::CallEnded,
    }
}

/// Route one client event. Returns whether it reached a connection.
pub fn route_client_event(
    registry: &ConnectionRegistry,
    sender: &UserId,
    event: ClientEvent,
) -> bool {
    let target = event.target().clone();
    let forwarded = forwarded_event(sender, event);

    debug!(
        from = %sender.short(),
        to = %target.short(),
        "Relaying event"
    );

    registry.emit_to(&target, forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnId;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn test_offer_gains_sender() {
        let event = forwarded_event(
            &UserId::from("alice"),
            ClientEvent::Offer {
                to: UserId::from("bob"),
                offer: json!({"type": "offer"}),
            },
        );
        assert_eq!(
            event,
            ServerEvent::Offer {
                from: UserId::from("alice"),
                offer: json!({"type": "offer"}),
            }
        );
    }

    #[test]
    fn test_answer_loses_sender() {
        let event = forwarded_event(
            &UserId::from("alice"),
            ClientEvent::Answer {
                to: UserId::from("bob"),
                answer: json!({"type": "answer"}),
            },
        );
        assert_eq!(
            event,
            ServerEvent::Answer {
                answer: json!({"type": "answer"}),
            }
        );
    }

    #[test]
    fn test_accept_and_decline_drop_payload() {
        let accept = forwarded_event(
            &UserId::from("a"),
            ClientEvent::Accept {
                to: UserId::from("b"),
            },
        );
        let decline = forwarded_event(
            &UserId::from("a"),
            ClientEvent::Decline {
                to: UserId::from("b"),
            },
        );
        assert_eq!(accept, ServerEvent::CallAccept);
        assert_eq!(decline, ServerEvent::CallDecline);
    }

    #[test]
    fn test_route_to_offline_target_is_silent() {
        let registry = ConnectionRegistry::new();
        let delivered = route_client_event(
            &registry,
            &UserId::from("alice"),
            ClientEvent::Typing {
                to: UserId::from("nobody"),
            },
        );
        assert!(!delivered);
    }

    #[test]
    fn test_route_delivers_once_registered() {
        let registry = ConnectionRegistry::new();
        let bob = UserId::from("bob");
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(bob.clone(), ConnId::new(), tx);

        let delivered = route_client_event(
            &registry,
            &UserId::from("alice"),
            ClientEvent::Typing { to: bob },
        );
        assert!(delivered);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::Typing {
                from: UserId::from("alice")
            }
        );
    }
}
