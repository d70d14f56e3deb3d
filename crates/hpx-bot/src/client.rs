//! High-level bot client.
//!
//! [`BotClient`] wires the [`ConnectionManager`], the [`DispatchPipeline`]
//! and the [`CommandResolver`] together. A dispatch task reads the
//! connection's lossless inbound feed and processes every envelope in its
//! own task: middleware first, then command resolution for prefixed chat
//! messages. [`Event::Message`] is still published for observers, but
//! dispatch does not depend on it.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::{ArgSchema, CommandDefinition, CommandHandler, CommandResolver},
    config::ClientConfig,
    connection::{ConnectionManager, ConnectionState},
    context::ClientContext,
    envelope::Envelope,
    error::{BotResult, CommandError, MiddlewareError},
    events::{Event, EventBus},
    middleware::{DispatchPipeline, Middleware, MiddlewareConfig, MiddlewareInfo},
    subscription::Subscription,
    transport::Connector,
};

/// Bot runtime: connection, middleware and commands.
pub struct BotClient {
    connection: ConnectionManager,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    task: Mutex<Option<DispatchTask>>,
}

struct DispatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BotClient {
    /// Create a client. Validates the token and configuration; no I/O
    /// happens until [`start`](Self::start).
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        context: ClientContext,
    ) -> BotResult<Self> {
        config.validate()?;
        let url = config.endpoint()?;

        let events = EventBus::new(config.connection.event_channel_capacity);
        let connection =
            ConnectionManager::new(config.connection.clone(), url, connector, events.clone())?;
        let context = Arc::new(context);
        let dispatcher = Arc::new(Dispatcher {
            prefix: config.prefix,
            pipeline: DispatchPipeline::new(),
            resolver: CommandResolver::new(Arc::clone(&context)),
            context,
            events: events.clone(),
        });

        Ok(Self {
            connection,
            dispatcher,
            events,
            task: Mutex::new(None),
        })
    }

    /// Create a client that connects over WebSocket.
    #[cfg(feature = "tungstenite")]
    pub fn websocket(config: ClientConfig, context: ClientContext) -> BotResult<Self> {
        Self::new(
            config,
            Arc::new(crate::transport::tungstenite::TungsteniteConnector::new()),
            context,
        )
    }

    /// Start dispatching and connect. Resolves once the connection is open.
    pub async fn start(&self) -> BotResult<()> {
        self.spawn_dispatcher();
        self.connection.connect().await
    }

    /// Start with initial subscriptions.
    pub async fn start_with(
        &self,
        subscriptions: impl IntoIterator<Item = Subscription>,
    ) -> BotResult<()> {
        self.spawn_dispatcher();
        self.connection.connect_with(subscriptions).await
    }

    fn spawn_dispatcher(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            self.connection.inbound_feed(),
            Arc::clone(&self.dispatcher),
            cancel.clone(),
        ));
        *task = Some(DispatchTask { cancel, handle });
    }

    /// Close the connection and stop dispatching new messages.
    ///
    /// Handlers already running are left to finish.
    pub async fn stop(&self) -> BotResult<()> {
        let result = self.connection.close().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(err) = task.handle.await {
                debug!(error = %err, "Dispatch task ended abnormally");
            }
        }
        result
    }

    /// The underlying connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Bus carrying connection and dispatch events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The command resolver.
    pub fn resolver(&self) -> &CommandResolver {
        &self.dispatcher.resolver
    }

    /// The middleware pipeline run before command resolution.
    pub fn pipeline(&self) -> &DispatchPipeline {
        &self.dispatcher.pipeline
    }

    /// Shared client context handed to every command.
    pub fn context(&self) -> &ClientContext {
        &self.dispatcher.context
    }

    /// Whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Send a raw payload, queued while offline.
    pub fn send(&self, payload: impl Into<String>) {
        self.connection.send(payload);
    }

    /// Serialize `value` and send it.
    pub fn send_json<T: Serialize>(&self, value: &T) -> BotResult<()> {
        self.connection.send_json(value)
    }

    /// Subscribe to `(category, id)`; replayed after every reconnect.
    pub fn subscribe(&self, category: impl Into<String>, id: i64) {
        self.connection.subscribe(category, id);
    }

    /// Drop a subscription.
    pub fn unsubscribe(&self, category: impl Into<String>, id: i64) {
        self.connection.unsubscribe(category, id);
    }

    /// Register `handler` under `name`. See [`CommandResolver::register_command`].
    pub fn register_command(
        &self,
        name: &str,
        schema: ArgSchema,
        handler: impl CommandHandler,
    ) -> Result<(), CommandError> {
        self.resolver().register_command(name, schema, handler)
    }

    /// Register a fully described command.
    pub fn register(&self, definition: CommandDefinition) -> Result<(), CommandError> {
        self.resolver().register(definition)
    }

    /// Remove a command and its aliases.
    pub fn remove_command(&self, name: &str) -> bool {
        self.resolver().remove_command(name)
    }

    /// Make `alias` resolve to `command`.
    pub fn add_alias(&self, alias: &str, command: &str) -> Result<(), CommandError> {
        self.resolver().add_alias(alias, command)
    }

    /// Registered command names, sorted.
    pub fn get_commands(&self) -> Vec<String> {
        self.resolver().get_commands()
    }

    /// Put `user_id` on cooldown for `command`.
    pub fn set_cooldown(&self, command: &str, user_id: i64, duration: Duration) {
        self.resolver().set_cooldown(command, user_id, duration);
    }

    /// Remaining cooldown, or zero.
    pub fn check_cooldown(&self, command: &str, user_id: i64) -> Duration {
        self.resolver().check_cooldown(command, user_id)
    }

    /// Add a middleware; returns its name.
    pub fn use_middleware<M: Middleware>(
        &self,
        middleware: M,
        config: MiddlewareConfig,
    ) -> Result<String, MiddlewareError> {
        self.pipeline().use_middleware(middleware, config)
    }

    /// Remove a middleware by name.
    pub fn remove_middleware(&self, name: &str) -> bool {
        self.pipeline().remove(name)
    }

    /// Registered middleware in registration order.
    pub fn list_middleware(&self) -> Vec<MiddlewareInfo> {
        self.pipeline().list()
    }
}

impl Drop for BotClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

struct Dispatcher {
    prefix: String,
    pipeline: DispatchPipeline,
    resolver: CommandResolver,
    context: Arc<ClientContext>,
    events: EventBus,
}

impl Dispatcher {
    async fn handle(&self, envelope: Arc<Envelope>) {
        let mut envelope = Envelope::clone(&envelope);

        let report = self.pipeline.execute(&mut envelope).await;
        for failure in report.failures {
            self.events.emit(Event::MiddlewareFailed {
                name: failure.name,
                error: Arc::new(failure.error),
            });
        }

        if !envelope.is_chat_message() {
            return;
        }
        let Some(body) = envelope
            .text()
            .and_then(|text| text.strip_prefix(self.prefix.as_str()))
            .map(str::to_owned)
        else {
            return;
        };
        let message = match envelope.chat_message() {
            Ok(message) => Arc::new(message),
            Err(err) => {
                warn!(error = %err, "Dropping undecodable chat message");
                return;
            }
        };
        if self.context.is_own_message(&message) {
            return;
        }

        let envelope = Arc::new(envelope);
        match self
            .resolver
            .dispatch(&body, Arc::clone(&message), envelope)
            .await
        {
            Ok(command) => debug!(%command, "Command completed"),
            Err(CommandError::CommandNotFound { name, .. }) => {
                info!(command = %name, "Unknown command");
                self.events.emit(Event::UnknownCommand {
                    text: message.text.clone(),
                    message,
                });
            }
            Err(err) => {
                let token = body.split_whitespace().next().unwrap_or_default();
                let command = self
                    .resolver
                    .resolve_name(token)
                    .unwrap_or_else(|| token.to_string());
                warn!(%command, error = %err, "Command failed");
                self.events.emit(Event::CommandFailed {
                    command,
                    error: Arc::new(err),
                    message,
                });
            }
        }
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Arc<Envelope>>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => match envelope {
                Some(envelope) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move { dispatcher.handle(envelope).await });
                }
                None => break,
            },
        }
    }
    debug!("Dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::BotError, transport::memory::MemoryConnector};

    fn client(token: &str) -> BotResult<BotClient> {
        let (connector, _server) = MemoryConnector::new();
        BotClient::new(
            ClientConfig::new("ws://memory.test/ws", token),
            Arc::new(connector),
            ClientContext::new(),
        )
    }

    #[test]
    fn test_invalid_token_fails_at_construction() {
        assert!(matches!(
            client(""),
            Err(BotError::TokenValidation { .. })
        ));
        assert!(matches!(
            client("bad token"),
            Err(BotError::TokenValidation { .. })
        ));
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = client("secret").expect("client");
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.get_commands().is_empty());
    }
}
