//! Client core: chat synchronization and call orchestration.
//!
//! [`chat::ChatState`] reconciles conversation state against REST
//! responses and pushed socket events; [`call::CallController`] drives
//! the media layer through the call lifecycle; [`bridge::run_bridge`]
//! pumps socket notifications and media events into both.

pub mod bridge;
pub mod call;
pub mod chat;
pub mod typing;

pub use bridge::run_bridge;
pub use call::{CallController, CallControllerConfig, CallCtrlError, CallState, RingTimeout};
pub use chat::{ChatError, ChatState};
pub use typing::TypingNotifier;
