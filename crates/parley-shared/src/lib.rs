//! Shared types and the wire event contract for the Parley chat system.

pub mod constants;
pub mod events;
pub mod models;
pub mod types;
