//! Call media layer: owns the peer connection and its negotiation
//! lifecycle.
//!
//! [`PeerSession`] manages exactly one WebRTC peer connection at a time:
//! local track setup, offer/answer/ICE exchange, connection-state
//! tracking, and bounded automatic recovery via ICE restart. All
//! asynchronous outcomes are published on a single typed event channel
//! ([`CallEvent`]) consumed by the call orchestration layer.

pub mod capture;
pub mod events;
pub mod ice;
pub mod peer;
pub mod retry;

pub use capture::{AudioCapture, AudioConfig, AudioError};
pub use events::{CallEvent, ConnectionState, NegotiationStep};
pub use ice::{IceConfig, IceServer};
pub use peer::{CallConfig, CallError, CaptureMode, Diagnostics, MediaConstraints, PeerSession};
pub use retry::{RetryDecision, RetryPolicy};
