//! Command handlers and the context they receive.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;

use super::args::Args;
use crate::{
    collaborators::SendRequest,
    context::ClientContext,
    envelope::{ChatMessage, Envelope},
    error::{ApiRequestError, BoxError},
};

/// Application code bound to a command.
///
/// Implemented for any `Fn(CommandContext, Args) -> impl Future<Output =
/// Result<(), BoxError>>`.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn call(&self, ctx: CommandContext, args: Args) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandContext, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn call(&self, ctx: CommandContext, args: Args) -> Result<(), BoxError> {
        (self)(ctx, args).await
    }
}

/// What a handler knows about the invocation.
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// Resolved command name (never an alias).
    pub command: String,
    /// The invoking chat message.
    pub message: Arc<ChatMessage>,
    /// The envelope the message arrived in, after middleware.
    pub envelope: Arc<Envelope>,
    client: Arc<ClientContext>,
}

impl CommandContext {
    pub(crate) fn new(
        command: impl Into<String>,
        message: Arc<ChatMessage>,
        envelope: Arc<Envelope>,
        client: Arc<ClientContext>,
    ) -> Self {
        Self {
            command: command.into(),
            message,
            envelope,
            client,
        }
    }

    /// Id of the invoking user.
    pub fn user_id(&self) -> i64 {
        self.message.user_id()
    }

    /// The client context.
    pub fn client(&self) -> &ClientContext {
        &self.client
    }

    /// Reply in the invoking message's dialog.
    pub async fn reply(&self, text: impl Into<String>) -> Result<ChatMessage, ApiRequestError> {
        self.send(SendRequest::new(self.message.dialog_id, text).reply_to(self.message.id))
            .await
    }

    /// Send an arbitrary message through the configured sender.
    pub async fn send(&self, request: SendRequest) -> Result<ChatMessage, ApiRequestError> {
        self.client.message_send()?.send(request).await
    }
}
