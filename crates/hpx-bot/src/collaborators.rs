//! Contracts for the REST-side collaborators the runtime depends on.
//!
//! The runtime never talks HTTP itself. User lookups for `user` arguments
//! and replies from command handlers go through these traits, which the
//! application implements on top of its REST client.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    envelope::{ChatMessage, User},
    error::ApiRequestError,
};

/// Resolves users by their public tag.
#[async_trait]
pub trait UserFetch: Send + Sync + 'static {
    /// Look a user up by tag (without the leading `@`).
    ///
    /// Returns [`ApiRequestError::NotFound`] when nobody has this tag.
    async fn lookup(&self, tag: &str) -> Result<User, ApiRequestError>;
}

/// Sends chat messages.
#[async_trait]
pub trait MessageSend: Send + Sync + 'static {
    /// Send a message and return it as stored by the service.
    async fn send(&self, request: SendRequest) -> Result<ChatMessage, ApiRequestError>;
}

/// Parameters of an outgoing chat message.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SendRequest {
    pub dialog_id: i64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub photos: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Id of a message to edit instead of sending a new one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit: Option<i64>,
    /// Id of a message to repost.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repost: Option<i64>,
}

impl SendRequest {
    /// A plain text message to `dialog_id`.
    pub fn new(dialog_id: i64, text: impl Into<String>) -> Self {
        Self {
            dialog_id,
            text: text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reply_to(mut self, message_id: i64) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    #[must_use]
    pub fn photo(mut self, photo: impl Into<String>) -> Self {
        self.photos.push(photo.into());
        self
    }

    #[must_use]
    pub fn attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachments.push(attachment.into());
        self
    }

    #[must_use]
    pub fn edit(mut self, message_id: i64) -> Self {
        self.edit = Some(message_id);
        self
    }

    #[must_use]
    pub fn repost(mut self, message_id: i64) -> Self {
        self.repost = Some(message_id);
        self
    }
}

/// In-memory [`UserFetch`] backed by a tag map.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl UserDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user, keyed by its tag.
    pub fn insert(&self, user: User) {
        self.users.write().insert(user.tag.clone(), user);
    }

    /// Build a directory from a list of users.
    pub fn from_users(users: impl IntoIterator<Item = User>) -> Self {
        let directory = Self::new();
        for user in users {
            directory.insert(user);
        }
        directory
    }
}

#[async_trait]
impl UserFetch for UserDirectory {
    async fn lookup(&self, tag: &str) -> Result<User, ApiRequestError> {
        self.users
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| ApiRequestError::not_found(format!("user @{tag}")))
    }
}
