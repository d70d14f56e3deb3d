//! Typed lifecycle and dispatch events.
//!
//! Every signal the runtime raises is a variant of [`Event`], published on an
//! [`EventBus`] backed by a `tokio::sync::broadcast` channel. Listeners either
//! take the full stream ([`EventBus::subscribe`]) or a single
//! [`EventKind`] ([`EventBus::subscribe_kind`]).

use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    connection::ConnectionEpoch,
    envelope::{ChatMessage, Envelope},
    error::{BotError, BotResult, CommandError, MiddlewareError},
};

/// Signals raised by the connection manager and the dispatcher.
#[derive(Clone, Debug)]
pub enum Event {
    /// The connection reached `Open`; subscriptions were replayed and the
    /// outbound queue drained.
    Ready { epoch: ConnectionEpoch },
    /// A decoded inbound envelope.
    Message(Arc<Envelope>),
    /// The connection dropped and a reconnect is scheduled.
    Disconnected { code: Option<u16>, reason: String },
    /// The connection was closed by the application and will not reconnect.
    Close { code: Option<u16> },
    /// A transport-level error occurred.
    Error { message: String },
    /// Reconnect attempts were exhausted.
    ReconnectFailed { attempts: u32 },
    /// A prefixed message did not match any command or alias.
    UnknownCommand {
        text: String,
        message: Arc<ChatMessage>,
    },
    /// Resolving, parsing or running a command failed.
    CommandFailed {
        command: String,
        error: Arc<CommandError>,
        message: Arc<ChatMessage>,
    },
    /// A middleware returned an error or panicked.
    MiddlewareFailed {
        name: String,
        error: Arc<MiddlewareError>,
    },
}

/// Discriminant of [`Event`], used for per-kind subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Message,
    Disconnected,
    Close,
    Error,
    ReconnectFailed,
    UnknownCommand,
    CommandFailed,
    MiddlewareFailed,
}

impl Event {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready { .. } => EventKind::Ready,
            Self::Message(_) => EventKind::Message,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Close { .. } => EventKind::Close,
            Self::Error { .. } => EventKind::Error,
            Self::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            Self::UnknownCommand { .. } => EventKind::UnknownCommand,
            Self::CommandFailed { .. } => EventKind::CommandFailed,
            Self::MiddlewareFailed { .. } => EventKind::MiddlewareFailed,
        }
    }
}

/// Broadcast hub for [`Event`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow listener.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no listeners is fine.
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("Event dropped, no listeners");
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Receive only events of one kind.
    pub fn subscribe_kind(&self, kind: EventKind) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            kind,
        }
    }

    /// Number of active listeners.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait for the first event matching `predicate`.
    ///
    /// Fails with [`BotError::Timeout`] once `timeout` elapses and with
    /// [`BotError::Cancelled`] when `cancel` fires. The listener is dropped
    /// on every exit path.
    pub async fn wait_for<F>(
        &self,
        predicate: F,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> BotResult<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let rx = self.subscribe();
        wait_on(rx, predicate, timeout, cancel).await
    }
}

async fn wait_on<F>(
    mut rx: broadcast::Receiver<Event>,
    predicate: F,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
) -> BotResult<Event>
where
    F: Fn(&Event) -> bool,
{
    let matching = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "wait_for listener lagged");
                }
                Err(RecvError::Closed) => return Err(BotError::connection_closed(None)),
            }
        }
    };
    let deadline = async {
        match timeout {
            Some(duration) => {
                tokio::time::sleep(duration).await;
                duration
            }
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match &cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        () = cancelled => Err(BotError::Cancelled),
        duration = deadline => Err(BotError::timeout(duration)),
        result = matching => result,
    }
}

/// A receiver filtered to one [`EventKind`].
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    kind: EventKind,
}

impl EventSubscription {
    /// Next event of the subscribed kind, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind() == self.kind => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, kind = ?self.kind, "Event subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_kind_filters() {
        let bus = EventBus::new(8);
        let mut closes = bus.subscribe_kind(EventKind::Close);

        bus.emit(Event::Error {
            message: "boom".to_string(),
        });
        bus.emit(Event::Close { code: Some(1000) });

        match closes.recv().await {
            Some(Event::Close { code }) => assert_eq!(code, Some(1000)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_match() {
        let bus = EventBus::new(8);
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for(
                    |e| matches!(e, Event::ReconnectFailed { .. }),
                    Some(Duration::from_secs(5)),
                    None,
                )
                .await
            })
        };

        while bus.listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.emit(Event::Close { code: None });
        bus.emit(Event::ReconnectFailed { attempts: 3 });

        let event = waiter.await.expect("join").expect("event");
        assert!(matches!(event, Event::ReconnectFailed { attempts: 3 }));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_and_deregisters() {
        let bus = EventBus::new(8);
        let result = bus
            .wait_for(|_| true, Some(Duration::from_millis(100)), None)
            .await;
        assert!(matches!(result, Err(BotError::Timeout { .. })));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_cancellation_rejects_once() {
        let bus = EventBus::new(8);
        let token = CancellationToken::new();
        token.cancel();

        let result = bus.wait_for(|_| true, None, Some(token.clone())).await;
        assert!(matches!(result, Err(BotError::Cancelled)));
        assert_eq!(bus.listener_count(), 0);

        // A cancelled token wins even if a matching event is already queued.
        let rx = bus.subscribe();
        bus.emit(Event::Close { code: None });
        let result = wait_on(rx, |_| true, None, Some(token)).await;
        assert!(matches!(result, Err(BotError::Cancelled)));
        assert_eq!(bus.listener_count(), 0);
    }
}
