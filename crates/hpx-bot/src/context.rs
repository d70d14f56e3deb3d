//! Explicit per-client state shared by the resolver and command handlers.

use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{
    collaborators::{MessageSend, UserFetch},
    envelope::{ChatMessage, User},
    error::ApiRequestError,
};

/// Bot identity and collaborators, owned by one client.
#[derive(Default)]
pub struct ClientContext {
    bot: RwLock<Option<User>>,
    users: Option<Arc<dyn UserFetch>>,
    sender: Option<Arc<dyn MessageSend>>,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("bot", &*self.bot.read())
            .field("has_user_fetch", &self.users.is_some())
            .field("has_message_send", &self.sender.is_some())
            .finish()
    }
}

impl ClientContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user lookup used by `user` arguments.
    #[must_use]
    pub fn with_user_fetch(mut self, users: Arc<dyn UserFetch>) -> Self {
        self.users = Some(users);
        self
    }

    /// Set the sender used by [`crate::CommandContext::reply`].
    #[must_use]
    pub fn with_message_send(mut self, sender: Arc<dyn MessageSend>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the bot's own identity.
    #[must_use]
    pub fn with_bot(self, bot: User) -> Self {
        self.set_bot(bot);
        self
    }

    /// Replace the bot's own identity.
    pub fn set_bot(&self, bot: User) {
        *self.bot.write() = Some(bot);
    }

    /// The bot's own identity, if known.
    pub fn bot(&self) -> Option<User> {
        self.bot.read().clone()
    }

    /// Whether `message` was written by the bot itself.
    pub fn is_own_message(&self, message: &ChatMessage) -> bool {
        self.bot
            .read()
            .as_ref()
            .is_some_and(|bot| bot.id == message.sender.id)
    }

    /// The configured user lookup.
    pub fn user_fetch(&self) -> Result<&Arc<dyn UserFetch>, ApiRequestError> {
        self.users
            .as_ref()
            .ok_or_else(|| ApiRequestError::request("No user lookup configured"))
    }

    /// The configured message sender.
    pub fn message_send(&self) -> Result<&Arc<dyn MessageSend>, ApiRequestError> {
        self.sender
            .as_ref()
            .ok_or_else(|| ApiRequestError::request("No message sender configured"))
    }
}
