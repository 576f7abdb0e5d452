//! reqwest-backed implementation of the store contract.
//!
//! The store wraps every response in a `{success, ...}` envelope and
//! reports domain failures with `success: false` plus a message, still
//! under HTTP 200; both layers are checked here.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use parley_shared::models::{ChatUser, Message, MessageDraft};
use parley_shared::types::{MessageId, UserId};

use crate::error::{Result, StoreError};
use crate::store::{MessageStore, UserListing};

#[derive(Clone)]
pub struct HttpMessageStore {
    client: reqwest::Client,
    base_url: String,
    /// Opaque auth token from the (external) auth layer, sent on every
    /// request as the `token` header.
    token: String,
}

impl HttpMessageStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("token", &self.token)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        Ok(response.json::<T>().await?)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

impl Envelope {
    fn check(self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(StoreError::Api(
                self.message.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsersResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    users: Vec<ChatUser>,
    #[serde(default)]
    unseen_messages: HashMap<String, u32>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    users: Vec<ChatUser>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    new_message: Option<Message>,
}

fn api_failure(message: Option<String>) -> StoreError {
    StoreError::Api(message.unwrap_or_else(|| "unknown error".to_string()))
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn get_users(&self) -> Result<UserListing> {
        let response = self.request(reqwest::Method::GET, "/users").send().await?;
        let body: UsersResponse = Self::decode(response).await?;
        if !body.success {
            return Err(api_failure(body.message));
        }

        debug!(users = body.users.len(), "Fetched sidebar users");

        Ok(UserListing {
            users: body.users,
            unseen: body
                .unseen_messages
                .into_iter()
                .map(|(id, count)| (UserId::new(id), count))
                .collect(),
        })
    }

    async fn search_users(&self, query: &str) -> Result<Vec<ChatUser>> {
        let response = self
            .request(reqwest::Method::GET, "/search")
            .query(&[("q", query)])
            .send()
            .await?;
        let body: SearchResponse = Self::decode(response).await?;
        if !body.success {
            return Err(api_failure(body.message));
        }
        Ok(body.users)
    }

    async fn get_conversation(&self, peer: &UserId) -> Result<Vec<Message>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/{peer}"))
            .send()
            .await?;
        let body: MessagesResponse = Self::decode(response).await?;
        if !body.success {
            return Err(api_failure(body.message));
        }

        debug!(peer = %peer.short(), count = body.messages.len(), "Fetched conversation");
        Ok(body.messages)
    }

    async fn send_message(&self, peer: &UserId, draft: MessageDraft) -> Result<Message> {
        let response = self
            .request(reqwest::Method::POST, &format!("/send/{peer}"))
            .json(&draft)
            .send()
            .await?;
        let body: SendResponse = Self::decode(response).await?;
        if !body.success {
            return Err(api_failure(body.message));
        }
        body.new_message
            .ok_or_else(|| StoreError::Api("missing created message".to_string()))
    }

    async fn mark_seen(&self, id: &MessageId) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/mark/{id}"))
            .send()
            .await?;
        Self::decode::<Envelope>(response).await?.check()
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/{id}"))
            .send()
            .await?;
        Self::decode::<Envelope>(response).await?.check()
    }

    async fn delete_all_messages(&self, peer: &UserId) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/all/{peer}"))
            .send()
            .await?;
        Self::decode::<Envelope>(response).await?.check()
    }
}
