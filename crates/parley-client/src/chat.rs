//! Conversation state: messages, unseen counters, typing and presence.
//!
//! Reconciles three input sources — REST fetches, REST mutation results
//! and pushed socket events — under two invariants:
//!
//! - a peer's unseen counter always equals the number of their messages
//!   we hold with `seen == false`, and the counter entry is *removed* at
//!   zero rather than stored as an explicit 0;
//! - the full message list stays complete even for unselected peers, so
//!   switching conversations never loses history.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, warn};

use parley_shared::events::ServerEvent;
use parley_shared::models::{ChatUser, Message, MessageDraft};
use parley_shared::types::{MessageId, UserId};
use parley_store::{MessageStore, StoreError};

#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No peer selected")]
    NoPeerSelected,
}

pub struct ChatState<S: MessageStore> {
    store: S,
    self_id: UserId,
    messages: Vec<Message>,
    users: Vec<ChatUser>,
    selected: Option<UserId>,
    unseen: HashMap<UserId, u32>,
    typing_peers: HashSet<UserId>,
    online_users: HashSet<UserId>,
}

impl<S: MessageStore> ChatState<S> {
    pub fn new(store: S, self_id: UserId) -> Self {
        Self {
            store,
            self_id,
            messages: Vec::new(),
            users: Vec::new(),
            selected: None,
            unseen: HashMap::new(),
            typing_peers: HashSet::new(),
            online_users: HashSet::new(),
        }
    }

    /// Fetch the sidebar: chat partners and their unseen counts.
    pub async fn load_users(&mut self) -> Result<(), ChatError> {
        let listing = self.store.get_users().await?;
        self.users = listing.users;
        // Zero entries never exist as explicit keys.
        self.unseen = listing
            .unseen
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .collect();
        Ok(())
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<ChatUser>, ChatError> {
        Ok(self.store.search_users(query).await?)
    }

    /// Switch the open conversation.
    ///
    /// The visible list is cleared before the fetch resolves so a slow
    /// response never shows the previous peer's messages. The store marks
    /// the incoming side seen during the fetch (and notifies the sender),
    /// so the local copies and the counter are settled here as well.
    pub async fn select_peer(&mut self, peer: UserId) -> Result<(), ChatError> {
        self.messages.clear();
        self.selected = Some(peer.clone());
        self.unseen.remove(&peer);

        let mut history = self.store.get_conversation(&peer).await?;
        for message in &mut history {
            if message.sender_id == peer {
                message.seen = true;
            }
        }
        self.messages = history;

        debug!(peer = %peer.short(), count = self.messages.len(), "Conversation loaded");
        Ok(())
    }

    /// Send a message to `to`, or to the selected peer when `to` is None.
    ///
    /// The canonical message returned by the store is appended locally
    /// only when it belongs to the open conversation, so sharing to a
    /// different recipient never leaks into the current one.
    pub async fn send_message(
        &mut self,
        draft: MessageDraft,
        to: Option<UserId>,
    ) -> Result<Message, ChatError> {
        let target = to
            .or_else(|| self.selected.clone())
            .ok_or(ChatError::NoPeerSelected)?;

        let message = self.store.send_message(&target, draft).await?;

        if self.selected.as_ref() == Some(&target) {
            self.messages.push(message.clone());
        }

        Ok(message)
    }

    /// Delete one message locally and from the store. The peer's copy is
    /// removed by the mirrored `messageDeleted` push — best effort only.
    pub async fn delete_message(&mut self, id: &MessageId) -> Result<(), ChatError> {
        self.store.delete_message(id).await?;
        self.remove_local_message(id);
        Ok(())
    }

    /// Delete the whole conversation with `peer`.
    pub async fn delete_all_messages(&mut self, peer: &UserId) -> Result<(), ChatError> {
        self.store.delete_all_messages(peer).await?;
        self.remove_conversation(peer);
        Ok(())
    }

    /// Apply one pushed server event.
    pub async fn apply_server_event(&mut self, event: ServerEvent) -> Result<(), ChatError> {
        match event {
            ServerEvent::NewMessage { message } => {
                self.handle_new_message(message).await?;
            }

            ServerEvent::MessageSeen { id } => {
                self.mark_message_seen(&id);
            }

            ServerEvent::MessagesSeen { ids } => {
                for id in &ids {
                    self.mark_message_seen(id);
                }
            }

            ServerEvent::MessageDeleted { id } => {
                self.remove_local_message(&id);
            }

            ServerEvent::AllMessagesDeleted { user_id } => {
                self.remove_conversation(&user_id);
            }

            ServerEvent::NewChatUser { user, message } => {
                self.upsert_user(user);
                self.handle_new_message(message).await?;
            }

            ServerEvent::Typing { from } => {
                self.typing_peers.insert(from);
            }

            ServerEvent::StopTyping { from } => {
                self.typing_peers.remove(&from);
            }

            ServerEvent::OnlineUsers { users } => {
                self.online_users = users.into_iter().collect();
            }

            // Call signaling is the call controller's concern.
            other => {
                debug!(event = ?other, "Ignoring non-chat event");
            }
        }
        Ok(())
    }

    async fn handle_new_message(&mut self, mut message: Message) -> Result<(), ChatError> {
        let from_selected = self.selected.as_ref() == Some(&message.sender_id);

        if from_selected {
            // Open conversation: seen immediately, locally and at the store
            // (the store then notifies the sender).
            message.seen = true;
            let id = message.id.clone();
            self.messages.push(message);
            self.store.mark_seen(&id).await?;
        } else {
            if message.sender_id != self.self_id {
                *self.unseen.entry(message.sender_id.clone()).or_insert(0) += 1;

                if !self.knows_user(&message.sender_id) {
                    self.users
                        .push(ChatUser::placeholder(message.sender_id.clone()));
                }
            }
            // History stays complete even for unselected peers.
            self.messages.push(message);
        }
        Ok(())
    }

    /// Flip one message to seen and settle its sender's counter.
    fn mark_message_seen(&mut self, id: &MessageId) {
        let Some(message) = self.messages.iter_mut().find(|m| &m.id == id) else {
            debug!(id = %id, "Seen event for unknown message");
            return;
        };
        if message.seen {
            return;
        }
        message.seen = true;

        let sender = message.sender_id.clone();
        if sender != self.self_id {
            self.decrement_unseen(&sender);
        }
    }

    fn remove_local_message(&mut self, id: &MessageId) {
        let Some(position) = self.messages.iter().position(|m| &m.id == id) else {
            return;
        };
        let message = self.messages.remove(position);

        // A deleted message that was never seen no longer counts as unseen.
        if !message.seen && message.sender_id != self.self_id {
            self.decrement_unseen(&message.sender_id);
        }
    }

    fn remove_conversation(&mut self, peer: &UserId) {
        self.messages.retain(|m| {
            !(m.sender_id == *peer && m.receiver_id == self.self_id
                || m.sender_id == self.self_id && m.receiver_id == *peer)
        });
        self.unseen.remove(peer);
    }

    fn decrement_unseen(&mut self, peer: &UserId) {
        match self.unseen.get_mut(peer) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.unseen.remove(peer);
            }
            None => {
                warn!(peer = %peer.short(), "Unseen counter already absent");
            }
        }
    }

    fn knows_user(&self, id: &UserId) -> bool {
        self.users.iter().any(|u| &u.id == id)
    }

    fn upsert_user(&mut self, user: ChatUser) {
        match self.users.iter_mut().find(|u| u.id == user.id) {
            Some(existing) => *existing = user,
            None => self.users.push(user),
        }
    }

    // --- Accessors ---

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn users(&self) -> &[ChatUser] {
        &self.users
    }

    pub fn selected_peer(&self) -> Option<&UserId> {
        self.selected.as_ref()
    }

    pub fn unseen_count(&self, peer: &UserId) -> u32 {
        self.unseen.get(peer).copied().unwrap_or(0)
    }

    /// Whether an explicit counter entry exists (absent means zero).
    pub fn has_unseen_entry(&self, peer: &UserId) -> bool {
        self.unseen.contains_key(peer)
    }

    pub fn is_typing(&self, peer: &UserId) -> bool {
        self.typing_peers.contains(peer)
    }

    pub fn is_online(&self, peer: &UserId) -> bool {
        self.online_users.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    use parley_store::UserListing;

    /// In-memory store mirroring the REST contract's side effects.
    struct MemoryStore {
        self_id: UserId,
        inner: Mutex<MemoryInner>,
    }

    #[derive(Default)]
    struct MemoryInner {
        messages: Vec<Message>,
        users: Vec<ChatUser>,
        marked: Vec<MessageId>,
        next_id: u32,
    }

    impl MemoryStore {
        fn new(self_id: &str) -> Self {
            Self {
                self_id: UserId::from(self_id),
                inner: Mutex::new(MemoryInner::default()),
            }
        }

        fn seed_message(&self, id: &str, from: &str, to: &str, seen: bool) {
            self.inner.lock().unwrap().messages.push(Message {
                id: MessageId::from(id),
                sender_id: UserId::from(from),
                receiver_id: UserId::from(to),
                text: Some("hi".to_string()),
                image: None,
                seen,
                created_at: Utc::now(),
            });
        }

        fn marked(&self) -> Vec<MessageId> {
            self.inner.lock().unwrap().marked.clone()
        }
    }

    #[async_trait]
    impl MessageStore for MemoryStore {
        async fn get_users(&self) -> parley_store::error::Result<UserListing> {
            let inner = self.inner.lock().unwrap();
            let mut unseen: HashMap<UserId, u32> = HashMap::new();
            for m in &inner.messages {
                if m.receiver_id == self.self_id && !m.seen {
                    *unseen.entry(m.sender_id.clone()).or_insert(0) += 1;
                }
            }
            Ok(UserListing {
                users: inner.users.clone(),
                unseen,
            })
        }

        async fn search_users(
            &self,
            query: &str,
        ) -> parley_store::error::Result<Vec<ChatUser>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .users
                .iter()
                .filter(|u| u.full_name.contains(query))
                .cloned()
                .collect())
        }

        async fn get_conversation(
            &self,
            peer: &UserId,
        ) -> parley_store::error::Result<Vec<Message>> {
            let mut inner = self.inner.lock().unwrap();
            // Fetching marks the incoming side seen, like the real store.
            for m in inner.messages.iter_mut() {
                if m.sender_id == *peer && m.receiver_id == self.self_id {
                    m.seen = true;
                }
            }
            Ok(inner
                .messages
                .iter()
                .filter(|m| {
                    m.sender_id == *peer && m.receiver_id == self.self_id
                        || m.sender_id == self.self_id && m.receiver_id == *peer
                })
                .cloned()
                .collect())
        }

        async fn send_message(
            &self,
            peer: &UserId,
            draft: MessageDraft,
        ) -> parley_store::error::Result<Message> {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let message = Message {
                id: MessageId::new(format!("m{}", inner.next_id)),
                sender_id: self.self_id.clone(),
                receiver_id: peer.clone(),
                text: draft.text,
                image: draft.image,
                seen: false,
                created_at: Utc::now(),
            };
            inner.messages.push(message.clone());
            Ok(message)
        }

        async fn mark_seen(&self, id: &MessageId) -> parley_store::error::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(m) = inner.messages.iter_mut().find(|m| &m.id == id) {
                m.seen = true;
            }
            inner.marked.push(id.clone());
            Ok(())
        }

        async fn delete_message(&self, id: &MessageId) -> parley_store::error::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.messages.retain(|m| &m.id != id);
            Ok(())
        }

        async fn delete_all_messages(
            &self,
            peer: &UserId,
        ) -> parley_store::error::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            let self_id = self.self_id.clone();
            inner.messages.retain(|m| {
                !(m.sender_id == *peer && m.receiver_id == self_id
                    || m.sender_id == self_id && m.receiver_id == *peer)
            });
            Ok(())
        }
    }

    fn incoming(id: &str, from: &str, to: &str) -> Message {
        Message {
            id: MessageId::from(id),
            sender_id: UserId::from(from),
            receiver_id: UserId::from(to),
            text: Some("hi".to_string()),
            image: None,
            seen: false,
            created_at: Utc::now(),
        }
    }

    /// The tested invariant: for every peer, the counter equals the
    /// number of their unseen messages, and zero means no entry.
    fn assert_counter_invariant(chat: &ChatState<MemoryStore>, peer: &UserId) {
        let actual = chat
            .messages()
            .iter()
            .filter(|m| m.sender_id == *peer && m.receiver_id == *chat.self_id() && !m.seen)
            .count() as u32;
        assert_eq!(chat.unseen_count(peer), actual);
        assert_eq!(chat.has_unseen_entry(peer), actual > 0);
    }

    #[tokio::test]
    async fn test_message_from_selected_peer_is_seen_immediately() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));
        chat.select_peer(UserId::from("alice")).await.unwrap();

        chat.apply_server_event(ServerEvent::NewMessage {
            message: incoming("m1", "alice", "bob"),
        })
        .await
        .unwrap();

        assert_eq!(chat.messages().len(), 1);
        assert!(chat.messages()[0].seen);
        assert_eq!(chat.unseen_count(&UserId::from("alice")), 0);
        assert!(!chat.has_unseen_entry(&UserId::from("alice")));
        // The explicit mark-seen call fired.
        assert_eq!(chat.store.marked(), vec![MessageId::from("m1")]);
    }

    #[tokio::test]
    async fn test_message_from_unselected_peer_increments_counter() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));
        chat.select_peer(UserId::from("carol")).await.unwrap();

        chat.apply_server_event(ServerEvent::NewMessage {
            message: incoming("m1", "alice", "bob"),
        })
        .await
        .unwrap();

        let alice = UserId::from("alice");
        assert_eq!(chat.unseen_count(&alice), 1);
        // Still appended: history stays complete for unselected peers.
        assert_eq!(chat.messages().len(), 1);
        assert!(!chat.messages()[0].seen);
        assert!(chat.store.marked().is_empty());
        assert_counter_invariant(&chat, &alice);
    }

    #[tokio::test]
    async fn test_unknown_sender_gets_placeholder_user() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));

        chat.apply_server_event(ServerEvent::NewMessage {
            message: incoming("m1", "mystery", "bob"),
        })
        .await
        .unwrap();

        let user = chat
            .users()
            .iter()
            .find(|u| u.id == UserId::from("mystery"))
            .expect("placeholder user");
        assert_eq!(user.full_name, "mystery");
        assert!(user.profile_pic.is_none());
    }

    #[tokio::test]
    async fn test_selecting_peer_clears_counter_and_marks_seen() {
        let store = MemoryStore::new("bob");
        store.seed_message("m1", "alice", "bob", false);
        store.seed_message("m2", "alice", "bob", false);

        let mut chat = ChatState::new(store, UserId::from("bob"));
        chat.load_users().await.unwrap();

        let alice = UserId::from("alice");
        assert_eq!(chat.unseen_count(&alice), 2);

        chat.select_peer(alice.clone()).await.unwrap();
        assert!(!chat.has_unseen_entry(&alice));
        assert_eq!(chat.messages().len(), 2);
        assert!(chat.messages().iter().all(|m| m.seen));
        assert_counter_invariant(&chat, &alice);
    }

    #[tokio::test]
    async fn test_sender_side_messages_seen_flips_local_copies() {
        // Alice's side: she sent messages to bob, then bob opened the chat
        // and a messagesSeen push came back.
        let store = MemoryStore::new("alice");
        let mut chat = ChatState::new(store, UserId::from("alice"));
        chat.select_peer(UserId::from("bob")).await.unwrap();

        let sent = chat
            .send_message(MessageDraft::text("hi"), None)
            .await
            .unwrap();
        assert!(!chat.messages()[0].seen);

        chat.apply_server_event(ServerEvent::MessagesSeen {
            ids: vec![sent.id.clone()],
        })
        .await
        .unwrap();

        assert!(chat.messages()[0].seen);
    }

    #[tokio::test]
    async fn test_seen_events_decrement_counter_and_delete_at_zero() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));

        for id in ["m1", "m2"] {
            chat.apply_server_event(ServerEvent::NewMessage {
                message: incoming(id, "alice", "bob"),
            })
            .await
            .unwrap();
        }

        let alice = UserId::from("alice");
        assert_eq!(chat.unseen_count(&alice), 2);

        chat.apply_server_event(ServerEvent::MessageSeen {
            id: MessageId::from("m1"),
        })
        .await
        .unwrap();
        assert_eq!(chat.unseen_count(&alice), 1);
        assert!(chat.has_unseen_entry(&alice));
        assert_counter_invariant(&chat, &alice);

        chat.apply_server_event(ServerEvent::MessageSeen {
            id: MessageId::from("m2"),
        })
        .await
        .unwrap();
        assert!(!chat.has_unseen_entry(&alice));
        assert_counter_invariant(&chat, &alice);

        // Duplicate seen event: idempotent, counter never goes negative.
        chat.apply_server_event(ServerEvent::MessageSeen {
            id: MessageId::from("m2"),
        })
        .await
        .unwrap();
        assert!(!chat.has_unseen_entry(&alice));
    }

    #[tokio::test]
    async fn test_remote_delete_of_unseen_message_settles_counter() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));

        chat.apply_server_event(ServerEvent::NewMessage {
            message: incoming("m1", "alice", "bob"),
        })
        .await
        .unwrap();
        let alice = UserId::from("alice");
        assert_eq!(chat.unseen_count(&alice), 1);

        chat.apply_server_event(ServerEvent::MessageDeleted {
            id: MessageId::from("m1"),
        })
        .await
        .unwrap();

        assert!(chat.messages().is_empty());
        assert!(!chat.has_unseen_entry(&alice));
        assert_counter_invariant(&chat, &alice);
    }

    #[tokio::test]
    async fn test_delete_all_clears_conversation_and_counter() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));

        chat.apply_server_event(ServerEvent::NewMessage {
            message: incoming("m1", "alice", "bob"),
        })
        .await
        .unwrap();
        chat.apply_server_event(ServerEvent::NewMessage {
            message: incoming("m2", "carol", "bob"),
        })
        .await
        .unwrap();

        chat.apply_server_event(ServerEvent::AllMessagesDeleted {
            user_id: UserId::from("alice"),
        })
        .await
        .unwrap();

        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.messages()[0].sender_id, UserId::from("carol"));
        assert!(!chat.has_unseen_entry(&UserId::from("alice")));
        assert!(chat.has_unseen_entry(&UserId::from("carol")));
    }

    #[tokio::test]
    async fn test_send_message_appends_only_to_open_conversation() {
        let store = MemoryStore::new("alice");
        let mut chat = ChatState::new(store, UserId::from("alice"));
        chat.select_peer(UserId::from("bob")).await.unwrap();

        // Sharing to carol while bob's conversation is open.
        chat.send_message(MessageDraft::text("fwd"), Some(UserId::from("carol")))
            .await
            .unwrap();
        assert!(chat.messages().is_empty());

        chat.send_message(MessageDraft::text("hi bob"), None)
            .await
            .unwrap();
        assert_eq!(chat.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_typing_flag_tracks_events() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));
        let alice = UserId::from("alice");

        assert!(!chat.is_typing(&alice));
        chat.apply_server_event(ServerEvent::Typing {
            from: alice.clone(),
        })
        .await
        .unwrap();
        assert!(chat.is_typing(&alice));

        chat.apply_server_event(ServerEvent::StopTyping {
            from: alice.clone(),
        })
        .await
        .unwrap();
        assert!(!chat.is_typing(&alice));
    }

    #[tokio::test]
    async fn test_online_users_replace_presence_set() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));

        chat.apply_server_event(ServerEvent::OnlineUsers {
            users: vec![UserId::from("alice")],
        })
        .await
        .unwrap();
        assert!(chat.is_online(&UserId::from("alice")));

        chat.apply_server_event(ServerEvent::OnlineUsers { users: vec![] })
            .await
            .unwrap();
        assert!(!chat.is_online(&UserId::from("alice")));
    }

    #[tokio::test]
    async fn test_new_chat_user_upserts_directory_entry() {
        let store = MemoryStore::new("bob");
        let mut chat = ChatState::new(store, UserId::from("bob"));

        // Placeholder first, then the real entry arrives.
        chat.apply_server_event(ServerEvent::NewMessage {
            message: incoming("m1", "dora", "bob"),
        })
        .await
        .unwrap();

        chat.apply_server_event(ServerEvent::NewChatUser {
            user: ChatUser {
                id: UserId::from("dora"),
                full_name: "Dora".to_string(),
                profile_pic: None,
                bio: None,
            },
            message: incoming("m2", "dora", "bob"),
        })
        .await
        .unwrap();

        let entries: Vec<_> = chat
            .users()
            .iter()
            .filter(|u| u.id == UserId::from("dora"))
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].full_name, "Dora");
        assert_eq!(chat.unseen_count(&UserId::from("dora")), 2);
    }
}
