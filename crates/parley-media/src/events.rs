use serde_json::Value;

/// Coarse connection state of the media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// The negotiation step a [`super::CallError`] refers to, carried on
/// error events so each failing step is independently observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    Initialization,
    MediaAccess,
    CreateOffer,
    HandleOffer,
    CreateAnswer,
    HandleAnswer,
    AddIceCandidate,
    IceRestart,
}

/// Events published by a [`super::PeerSession`].
///
/// Most of these are asynchronous reactions to the underlying transport
/// rather than results of direct calls, so they flow through one channel
/// the consumer subscribes to once.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Initialized { is_initiator: bool },
    /// Local tracks are set up and attached.
    LocalStream { audio: bool, video: bool },
    /// A remote track arrived ("audio" or "video").
    RemoteStream { kind: String },
    Connected,
    IceStateChange { state: String, attempts: u32 },
    ConnectionStateChange { state: String },
    /// An automatic ICE-restart retry has been scheduled.
    Retrying { attempt: u32, max_retries: u32 },
    /// Terminal failure; no further automatic retries.
    Failed { reason: String, attempts: u32 },
    Error { step: NegotiationStep, detail: String },
    /// A locally gathered candidate, ready for transmission.
    IceCandidate(Value),
    OfferCreated(Value),
    AnswerCreated(Value),
    IceRestart,
}
