//! Client-side socket channel to the relay.
//!
//! The WebSocket connection runs in a dedicated tokio task. External code
//! communicates with it through typed command and notification channels,
//! keeping the networking layer fully asynchronous and decoupled.

pub mod socket;

pub use socket::{spawn_socket, SocketCommand, SocketConfig, SocketError, SocketNotification};
