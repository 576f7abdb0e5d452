//! Message-store access.
//!
//! The message store itself (persistence, auth, image upload) is an
//! external service; this crate carries the contract the chat layer
//! consumes — the [`MessageStore`] trait — and its HTTP implementation
//! over the store's REST surface.

pub mod error;
pub mod http;
pub mod store;

pub use error::StoreError;
pub use http::HttpMessageStore;
pub use store::{MessageStore, UserListing};
