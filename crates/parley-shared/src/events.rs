//! Wire events exchanged over the socket channel.
//!
//! Every frame is one JSON object tagged by `event`. SDP descriptions and
//! ICE candidates cross the relay as opaque `serde_json::Value` payloads:
//! the relay forwards them without interpreting their contents.
//!
//! The payload shapes are deliberately asymmetric where the relay rewrites
//! them: an offer is forwarded with the sender attached (`{from, offer}`),
//! an answer or candidate is forwarded payload-only, and accept/decline/
//! call-ended are forwarded with no payload at all.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ChatUser, Message};
use crate::types::{MessageId, UserId};

/// Events a client emits to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ClientEvent {
    #[serde(rename = "typing")]
    Typing { to: UserId },

    #[serde(rename = "stopTyping")]
    StopTyping { to: UserId },

    #[serde(rename = "webrtc-call-invitation")]
    CallInvitation { to: UserId },

    #[serde(rename = "webrtc-offer")]
    Offer { to: UserId, offer: Value },

    #[serde(rename = "webrtc-answer")]
    Answer { to: UserId, answer: Value },

    #[serde(rename = "webrtc-candidate")]
    Candidate { to: UserId, candidate: Value },

    #[serde(rename = "webrtc-accept")]
    Accept { to: UserId },

    #[serde(rename = "webrtc-decline")]
    Decline { to: UserId },

    #[serde(rename = "webrtc-call-ended")]
    CallEnded { to: UserId },
}

impl ClientEvent {
    /// The addressee every client event carries.
    pub fn target(&self) -> &UserId {
        match self {
            ClientEvent::Typing { to }
            | ClientEvent::StopTyping { to }
            | ClientEvent::CallInvitation { to }
            | ClientEvent::Offer { to, .. }
            | ClientEvent::Answer { to, .. }
            | ClientEvent::Candidate { to, .. }
            | ClientEvent::Accept { to }
            | ClientEvent::Decline { to }
            | ClientEvent::CallEnded { to } => to,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Events pushed from the server side to a client.
///
/// The relay produces the signaling/typing/presence events; the message
/// store service pushes the remaining events through the relay's internal
/// emit endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "typing")]
    Typing { from: UserId },

    #[serde(rename = "stopTyping")]
    StopTyping { from: UserId },

    #[serde(rename = "webrtc-call-invitation")]
    CallInvitation { from: UserId },

    #[serde(rename = "webrtc-offer")]
    Offer { from: UserId, offer: Value },

    #[serde(rename = "webrtc-answer")]
    Answer { answer: Value },

    #[serde(rename = "webrtc-candidate")]
    Candidate { candidate: Value },

    #[serde(rename = "webrtc-call-accept")]
    CallAccept,

    #[serde(rename = "webrtc-call-decline")]
    CallDecline,

    #[serde(rename = "webrtc-call-ended")]
    CallEnded,

    #[serde(rename = "getOnlineUsers")]
    OnlineUsers { users: Vec<UserId> },

    #[serde(rename = "newMessage")]
    NewMessage { message: Message },

    #[serde(rename = "messageSeen")]
    MessageSeen { id: MessageId },

    #[serde(rename = "messagesSeen")]
    MessagesSeen { ids: Vec<MessageId> },

    #[serde(rename = "messageDeleted")]
    MessageDeleted { id: MessageId },

    #[serde(rename = "allMessagesDeleted")]
    AllMessagesDeleted { user_id: UserId },

    #[serde(rename = "newChatUser")]
    NewChatUser { user: ChatUser, message: Message },
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_roundtrip() {
        let event = ClientEvent::Offer {
            to: UserId::from("u-receiver"),
            offer: serde_json::json!({"type": "offer", "sdp": "v=0..."}),
        };

        let json = event.to_json().unwrap();
        let restored = ClientEvent::from_json(&json).unwrap();
        assert_eq!(event, restored);
    }

    #[test]
    fn test_event_tag_names() {
        let json = ClientEvent::StopTyping {
            to: UserId::from("u1"),
        }
        .to_json()
        .unwrap();
        assert!(json.contains("\"stopTyping\""));

        let json = ServerEvent::CallAccept.to_json().unwrap();
        assert!(json.contains("\"webrtc-call-accept\""));
    }

    #[test]
    fn test_answer_has_no_from() {
        let event = ServerEvent::Answer {
            answer: serde_json::json!({"type": "answer", "sdp": "v=0..."}),
        };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert!(value.get("from").is_none());
        assert!(value.get("answer").is_some());
    }

    #[test]
    fn test_online_users_roundtrip() {
        let event = ServerEvent::OnlineUsers {
            users: vec![UserId::from("a"), UserId::from("b")],
        };
        let restored = ServerEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(event, restored);
    }
}
