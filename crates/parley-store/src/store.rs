use std::collections::HashMap;

use async_trait::async_trait;

use parley_shared::models::{ChatUser, Message, MessageDraft};
use parley_shared::types::{MessageId, UserId};

use crate::error::Result;

/// Sidebar listing: users plus their unseen-message counts.
#[derive(Debug, Clone, Default)]
pub struct UserListing {
    pub users: Vec<ChatUser>,
    pub unseen: HashMap<UserId, u32>,
}

/// The REST surface the chat layer consumes.
///
/// Side effects live server-side: fetching a conversation marks its
/// incoming messages seen (and triggers a `messagesSeen` push to the
/// sender), `mark_seen` triggers `messageSeen`, deletes trigger the
/// mirrored delete events.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// `GET /users` — chat partners and per-peer unseen counts.
    async fn get_users(&self) -> Result<UserListing>;

    /// `GET /search?q=` — user directory search by name.
    async fn search_users(&self, query: &str) -> Result<Vec<ChatUser>>;

    /// `GET /:peerId` — full conversation history with a peer.
    async fn get_conversation(&self, peer: &UserId) -> Result<Vec<Message>>;

    /// `POST /send/:peerId` — returns the canonical created message.
    async fn send_message(&self, peer: &UserId, draft: MessageDraft) -> Result<Message>;

    /// `PUT /mark/:messageId` — mark one message seen.
    async fn mark_seen(&self, id: &MessageId) -> Result<()>;

    /// `DELETE /:messageId`
    async fn delete_message(&self, id: &MessageId) -> Result<()>;

    /// `DELETE /all/:peerId` — clear the whole conversation.
    async fn delete_all_messages(&self, peer: &UserId) -> Result<()>;
}
