//! Connection manager for the real-time service.
//!
//! A background task (the driver) owns the single live transport and walks
//! the [`ConnectionState`] machine:
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──open──▶ Open ──close()──▶ Closing ──▶ Closed
//!                                  ▲   │              │
//!                         backoff  │   │ fail         │ lost / pong timeout
//!                                  │   ▼              ▼
//!                               Reconnecting ◀────────┘
//!                                  │
//!                                  └── attempts exhausted ──▶ Failed
//! ```
//!
//! On every transition into `Open` the driver, in order: resets the attempt
//! counter, starts the heartbeat, replays the [`SubscriptionRegistry`],
//! drains the outbound queue, and emits [`Event::Ready`].
//!
//! The application talks to the driver through an unbounded command
//! channel, so sends and subscription changes are applied in call order
//! whether the connection is up or not.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::{ConnectionConfig, QueueOverflow},
    envelope::{ControlMessage, Envelope},
    error::{BotError, BotResult},
    events::{Event, EventBus},
    reconnect::calculate_backoff,
    subscription::{Subscription, SubscriptionRegistry},
    transport::{CLOSE_NORMAL, Connector, Frame, FrameSink, TransportParts},
};

/// Monotonic counter of successful opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectionEpoch(pub u64);

/// Connection state machine states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and never asked to connect.
    Disconnected,
    /// Opening a transport.
    Connecting {
        /// Reconnect attempt number (0 for the first connection).
        attempt: u32,
    },
    /// Transport open, ready for traffic.
    Open {
        /// Epoch of this connection.
        epoch: ConnectionEpoch,
    },
    /// Waiting out the backoff delay after a lost connection.
    Reconnecting {
        /// Attempt that will run after the delay.
        attempt: u32,
        /// Delay before that attempt.
        delay: Duration,
    },
    /// Gracefully closing on application request.
    Closing,
    /// Closed by the application. Will not reconnect on its own.
    Closed {
        /// Close code sent to the peer.
        code: Option<u16>,
    },
    /// Reconnect attempts exhausted. Will not reconnect on its own.
    Failed {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is open for traffic.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Check if the state is terminal (`Closed` or `Failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug)]
enum Command {
    Send(String),
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Close {
        generation: u64,
        code: u16,
        reason: String,
    },
}

/// FIFO of payloads accepted while the connection is not open.
struct OutboundQueue {
    items: VecDeque<String>,
    cap: Option<usize>,
    overflow: QueueOverflow,
    len: Arc<AtomicUsize>,
}

impl OutboundQueue {
    fn new(config: &ConnectionConfig, len: Arc<AtomicUsize>) -> Self {
        Self {
            items: VecDeque::new(),
            cap: config.max_queued_messages,
            overflow: config.queue_overflow,
            len,
        }
    }

    fn push(&mut self, payload: String) {
        if let Some(cap) = self.cap
            && self.items.len() >= cap
        {
            match self.overflow {
                QueueOverflow::DropOldest => {
                    self.items.pop_front();
                    warn!(cap, "Outbound queue full, dropped oldest payload");
                }
                QueueOverflow::DropNewest => {
                    warn!(cap, "Outbound queue full, dropped new payload");
                    return;
                }
            }
        }
        self.items.push_back(payload);
        self.sync_len();
    }

    fn push_front(&mut self, payload: String) {
        self.items.push_front(payload);
        self.sync_len();
    }

    fn pop_front(&mut self) -> Option<String> {
        let item = self.items.pop_front();
        self.sync_len();
        item
    }

    fn sync_len(&self) {
        self.len.store(self.items.len(), Ordering::Relaxed);
    }
}

/// State that outlives a single driver run.
struct DriverParts {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    queue: OutboundQueue,
    epoch: ConnectionEpoch,
}

enum DriverSlot {
    Idle(DriverParts),
    Running(JoinHandle<DriverParts>),
    Poisoned,
}

struct Inner {
    config: Arc<ConnectionConfig>,
    url: Url,
    connector: Arc<dyn Connector>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    subs: Arc<SubscriptionRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus,
    generation: AtomicU64,
    queued: Arc<AtomicUsize>,
    inbound: InboundFeed,
    slot: Mutex<DriverSlot>,
}

type InboundFeed = Arc<RwLock<Option<mpsc::UnboundedSender<Arc<Envelope>>>>>;

/// Keeps one logical connection alive, transparently to the application.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager. No I/O happens until [`connect`](Self::connect).
    pub fn new(
        config: ConnectionConfig,
        url: Url,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> BotResult<Self> {
        config.validate().map_err(BotError::config)?;

        let config = Arc::new(config);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let queued = Arc::new(AtomicUsize::new(0));
        let parts = DriverParts {
            cmd_rx,
            queue: OutboundQueue::new(&config, Arc::clone(&queued)),
            epoch: ConnectionEpoch::default(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                url,
                connector,
                cmd_tx,
                subs: Arc::new(SubscriptionRegistry::new()),
                state_tx,
                events,
                generation: AtomicU64::new(0),
                queued,
                inbound: Arc::new(RwLock::new(None)),
                slot: Mutex::new(DriverSlot::Idle(parts)),
            }),
        })
    }

    /// Connect and wait until the connection is open.
    ///
    /// Idempotent: while a connection task is alive this only waits. After
    /// `Closed` or `Failed` a fresh cycle starts with the attempt counter
    /// reset. Fails with [`BotError::Timeout`] after `connect_timeout`, with
    /// [`BotError::ReconnectFailed`] if attempts are exhausted first.
    pub async fn connect(&self) -> BotResult<()> {
        self.ensure_driver().await?;
        self.wait_open().await
    }

    /// Register `initial` subscriptions, then [`connect`](Self::connect).
    pub async fn connect_with(
        &self,
        initial: impl IntoIterator<Item = Subscription>,
    ) -> BotResult<()> {
        for subscription in initial {
            self.push(Command::Subscribe(subscription));
        }
        self.connect().await
    }

    async fn ensure_driver(&self) -> BotResult<()> {
        let mut slot = self.inner.slot.lock().await;
        let parts = match std::mem::replace(&mut *slot, DriverSlot::Poisoned) {
            DriverSlot::Running(handle) if self.driver_alive(&handle) => {
                *slot = DriverSlot::Running(handle);
                return Ok(());
            }
            DriverSlot::Running(handle) => handle
                .await
                .map_err(|e| BotError::internal(format!("Connection task failed: {e}")))?,
            DriverSlot::Idle(parts) => parts,
            DriverSlot::Poisoned => {
                return Err(BotError::internal("Connection task previously panicked"));
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .state_tx
            .send_replace(ConnectionState::Connecting { attempt: 0 });

        let driver = Driver {
            config: Arc::clone(&self.inner.config),
            url: self.inner.url.clone(),
            connector: Arc::clone(&self.inner.connector),
            subs: Arc::clone(&self.inner.subs),
            state_tx: self.inner.state_tx.clone(),
            events: self.inner.events.clone(),
            inbound: Arc::clone(&self.inner.inbound),
            generation,
            attempt: 0,
            parts,
        };
        *slot = DriverSlot::Running(tokio::spawn(driver.run()));
        Ok(())
    }

    async fn wait_open(&self) -> BotResult<()> {
        let timeout = self.inner.config.connect_timeout;
        let mut rx = self.inner.state_tx.subscribe();
        let state = match tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.is_open() || s.is_terminal()),
        )
        .await
        {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => return Err(BotError::connection_closed(None)),
            Err(_) => return Err(BotError::timeout(timeout)),
        };

        match state {
            ConnectionState::Open { .. } => Ok(()),
            ConnectionState::Failed { attempts } => Err(BotError::ReconnectFailed { attempts }),
            ConnectionState::Closed { .. } => Err(BotError::connection_closed(Some(
                "Closed before the connection opened".to_string(),
            ))),
            other => Err(BotError::internal(format!(
                "Unexpected connection state: {other:?}"
            ))),
        }
    }

    /// Send a text payload.
    ///
    /// Fire-and-forget: written immediately while open, queued otherwise and
    /// flushed in order on the next open.
    pub fn send(&self, payload: impl Into<String>) {
        self.push(Command::Send(payload.into()));
    }

    /// Serialize `value` as JSON and [`send`](Self::send) it.
    pub fn send_json<T: Serialize>(&self, value: &T) -> BotResult<()> {
        self.send(serde_json::to_string(value)?);
        Ok(())
    }

    /// Observe `(category, id)`. Sent now if open, replayed on every open.
    pub fn subscribe(&self, category: impl Into<String>, id: i64) {
        self.push(Command::Subscribe(Subscription::new(category, id)));
    }

    /// Stop observing `(category, id)`.
    pub fn unsubscribe(&self, category: impl Into<String>, id: i64) {
        self.push(Command::Unsubscribe(Subscription::new(category, id)));
    }

    fn push(&self, command: Command) {
        if let Err(err) = self.inner.cmd_tx.send(command) {
            warn!(command = ?err.0, "Connection task is gone, command dropped");
        }
    }

    /// Close the connection with a normal close code.
    pub async fn close(&self) -> BotResult<()> {
        self.close_with(CLOSE_NORMAL, "").await
    }

    /// Close with an explicit code and reason.
    ///
    /// Terminal: no reconnect happens until [`connect`](Self::connect) is
    /// called again. Emits [`Event::Close`].
    pub async fn close_with(&self, code: u16, reason: &str) -> BotResult<()> {
        let mut slot = self.inner.slot.lock().await;
        match std::mem::replace(&mut *slot, DriverSlot::Poisoned) {
            DriverSlot::Running(handle) => {
                if self.driver_alive(&handle) {
                    self.push(Command::Close {
                        generation: self.inner.generation.load(Ordering::SeqCst),
                        code,
                        reason: reason.to_string(),
                    });
                }
                let parts = handle
                    .await
                    .map_err(|e| BotError::internal(format!("Connection task failed: {e}")))?;
                *slot = DriverSlot::Idle(parts);
                // The driver may have failed before it saw the close.
                let closed = matches!(
                    *self.inner.state_tx.borrow(),
                    ConnectionState::Closed { .. }
                );
                if !closed {
                    self.mark_closed(code);
                }
            }
            DriverSlot::Idle(parts) => {
                *slot = DriverSlot::Idle(parts);
                self.mark_closed(code);
            }
            DriverSlot::Poisoned => {}
        }
        Ok(())
    }

    /// A driver that published a terminal state is exiting, even if its
    /// task has not finished yet.
    fn driver_alive(&self, handle: &JoinHandle<DriverParts>) -> bool {
        !handle.is_finished() && !self.inner.state_tx.borrow().is_terminal()
    }

    fn mark_closed(&self, code: u16) {
        self.inner
            .state_tx
            .send_replace(ConnectionState::Closed { code: Some(code) });
        self.inner.events.emit(Event::Close { code: Some(code) });
    }

    /// Whether the connection is open. No side effects.
    pub fn is_open(&self) -> bool {
        self.inner.state_tx.borrow().is_open()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscriptions that will be replayed on the next open.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subs.snapshot()
    }

    /// Payloads currently held in the outbound queue.
    pub fn queued_len(&self) -> usize {
        self.inner.queued.load(Ordering::Relaxed)
    }

    /// The event bus this manager publishes on.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Take a lossless feed of decoded inbound envelopes.
    ///
    /// [`Event::Message`] on the broadcast bus is dropped for listeners that
    /// fall behind; this feed is not. A later call replaces the previous feed.
    pub fn inbound_feed(&self) -> mpsc::UnboundedReceiver<Arc<Envelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.inbound.write() = Some(tx);
        rx
    }
}

enum OpenOutcome {
    Lost { code: Option<u16>, reason: String },
    Closed { code: Option<u16> },
}

enum Attempt {
    Opened(TransportParts),
    Failed(BotError),
    Closed { code: Option<u16> },
}

struct Driver {
    config: Arc<ConnectionConfig>,
    url: Url,
    connector: Arc<dyn Connector>,
    subs: Arc<SubscriptionRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus,
    inbound: InboundFeed,
    generation: u64,
    attempt: u32,
    parts: DriverParts,
}

impl Driver {
    async fn run(mut self) -> DriverParts {
        info!(url = %redacted(&self.url), "Starting connection task");

        loop {
            self.set_state(ConnectionState::Connecting {
                attempt: self.attempt,
            });

            match self.open_transport().await {
                Attempt::Opened(transport) => {
                    self.attempt = 0;
                    match self.run_open(transport).await {
                        OpenOutcome::Closed { code } => {
                            self.finish_closed(code);
                            break;
                        }
                        OpenOutcome::Lost { code, reason } => {
                            warn!(?code, %reason, "Connection lost");
                            self.events.emit(Event::Disconnected { code, reason });
                        }
                    }
                }
                Attempt::Failed(err) => {
                    warn!(error = %err, attempt = self.attempt, "Connection attempt failed");
                    self.events.emit(Event::Error {
                        message: err.to_string(),
                    });
                }
                Attempt::Closed { code } => {
                    self.finish_closed(code);
                    break;
                }
            }

            if self.attempt >= self.config.reconnect_max_attempts {
                error!(attempts = self.attempt, "Max reconnection attempts exceeded");
                self.set_state(ConnectionState::Failed {
                    attempts: self.attempt,
                });
                self.events.emit(Event::ReconnectFailed {
                    attempts: self.attempt,
                });
                break;
            }

            self.attempt += 1;
            let delay = calculate_backoff(self.config.backoff(), self.attempt);
            debug!(
                delay_ms = delay.as_millis(),
                attempt = self.attempt,
                "Waiting before reconnect"
            );
            self.set_state(ConnectionState::Reconnecting {
                attempt: self.attempt,
                delay,
            });
            if let Some(code) = self.wait_backoff(delay).await {
                self.finish_closed(code);
                break;
            }
        }

        info!("Connection task stopped");
        self.parts
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn finish_closed(&self, code: Option<u16>) {
        info!(?code, "Connection closed");
        self.set_state(ConnectionState::Closed { code });
        self.events.emit(Event::Close { code });
    }

    /// Handles a command while no transport is open.
    ///
    /// Returns `Some(code)` when the connection must close for good.
    fn handle_offline(&mut self, command: Option<Command>) -> Option<Option<u16>> {
        match command {
            Some(Command::Send(payload)) => self.parts.queue.push(payload),
            Some(Command::Subscribe(sub)) => {
                self.subs.insert(sub);
            }
            Some(Command::Unsubscribe(sub)) => {
                self.subs.remove(&sub);
            }
            Some(Command::Close {
                generation, code, ..
            }) => {
                if generation == self.generation {
                    return Some(Some(code));
                }
                debug!(generation, "Ignoring close for a previous connection task");
            }
            None => return Some(None),
        }
        None
    }

    async fn open_transport(&mut self) -> Attempt {
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let timeout = self.config.connect_timeout;
        let connect = async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(BotError::timeout(timeout)),
            }
        };
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(transport) => Attempt::Opened(transport),
                        Err(err) => Attempt::Failed(err),
                    };
                }
                command = self.parts.cmd_rx.recv() => {
                    if let Some(code) = self.handle_offline(command) {
                        return Attempt::Closed { code };
                    }
                }
            }
        }
    }

    /// Sleeps out the backoff delay, queueing commands meanwhile.
    ///
    /// Returns `Some(code)` if the application closed the connection.
    async fn wait_backoff(&mut self, delay: Duration) -> Option<Option<u16>> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return None,
                command = self.parts.cmd_rx.recv() => {
                    if let Some(code) = self.handle_offline(command) {
                        return Some(code);
                    }
                }
            }
        }
    }

    async fn run_open(&mut self, transport: TransportParts) -> OpenOutcome {
        let TransportParts {
            mut sink,
            mut stream,
        } = transport;

        self.parts.epoch.0 += 1;
        let epoch = self.parts.epoch;
        self.set_state(ConnectionState::Open { epoch });
        info!(epoch = epoch.0, "Connection open");

        let mut ping_interval = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        let replay = self.subs.snapshot();
        if !replay.is_empty() {
            debug!(count = replay.len(), "Replaying subscriptions");
        }
        for sub in &replay {
            if let Err(err) = send_control(sink.as_mut(), &sub.subscribe_message()).await {
                return lost(err);
            }
        }

        let queued = self.parts.queue.items.len();
        if queued > 0 {
            debug!(count = queued, "Draining outbound queue");
        }
        while let Some(payload) = self.parts.queue.pop_front() {
            if let Err(err) = sink.send(Frame::Text(payload.clone())).await {
                self.parts.queue.push_front(payload);
                return lost(err);
            }
        }

        self.events.emit(Event::Ready { epoch });

        loop {
            tokio::select! {
                biased;
                command = self.parts.cmd_rx.recv() => {
                    let result = match command {
                        Some(Command::Send(payload)) => {
                            match sink.send(Frame::Text(payload.clone())).await {
                                Ok(()) => Ok(()),
                                Err(err) => {
                                    self.parts.queue.push_front(payload);
                                    Err(err)
                                }
                            }
                        }
                        Some(Command::Subscribe(sub)) => {
                            if self.subs.insert(sub.clone()) {
                                send_control(sink.as_mut(), &sub.subscribe_message()).await
                            } else {
                                Ok(())
                            }
                        }
                        Some(Command::Unsubscribe(sub)) => {
                            if self.subs.remove(&sub) {
                                send_control(sink.as_mut(), &sub.unsubscribe_message()).await
                            } else {
                                Ok(())
                            }
                        }
                        Some(Command::Close { generation, code, reason }) => {
                            if generation != self.generation {
                                debug!(generation, "Ignoring close for a previous connection task");
                                continue;
                            }
                            self.set_state(ConnectionState::Closing);
                            if let Err(err) = sink.close(code, &reason).await {
                                debug!(error = %err, "Error while closing transport");
                            }
                            return OpenOutcome::Closed { code: Some(code) };
                        }
                        None => {
                            if let Err(err) = sink.close(CLOSE_NORMAL, "").await {
                                debug!(error = %err, "Error while closing transport");
                            }
                            return OpenOutcome::Closed { code: None };
                        }
                    };
                    if let Err(err) = result {
                        return lost(err);
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Frame::Text(text))) => self.dispatch_text(&text),
                        Some(Ok(Frame::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.dispatch_text(text),
                            Err(err) => warn!(error = %err, "Dropping non UTF-8 binary frame"),
                        },
                        Some(Ok(Frame::Ping(data))) => {
                            if let Err(err) = sink.send(Frame::Pong(data)).await {
                                return lost(err);
                            }
                        }
                        Some(Ok(Frame::Pong(_))) => {
                            pong_deadline = None;
                        }
                        Some(Ok(Frame::Close(close))) => {
                            let (code, reason) = match close {
                                Some(close) => (Some(close.code), close.reason),
                                None => (None, "Peer closed the connection".to_string()),
                            };
                            return OpenOutcome::Lost { code, reason };
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "Transport read error");
                            self.events.emit(Event::Error { message: err.to_string() });
                            return lost(err);
                        }
                        None => {
                            return OpenOutcome::Lost {
                                code: None,
                                reason: "Transport stream ended".to_string(),
                            };
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if pong_deadline.is_some() {
                        continue;
                    }
                    if let Err(err) = sink.send(Frame::Ping(Bytes::new())).await {
                        return lost(err);
                    }
                    pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                }
                () = sleep_until_opt(pong_deadline) => {
                    warn!(
                        timeout_ms = self.config.pong_timeout.as_millis(),
                        "Pong timeout, terminating transport"
                    );
                    // Dropping both halves terminates without a close frame.
                    drop(sink);
                    drop(stream);
                    return OpenOutcome::Lost {
                        code: None,
                        reason: "Pong timeout".to_string(),
                    };
                }
            }
        }
    }

    fn dispatch_text(&self, text: &str) {
        match Envelope::from_text(text) {
            Ok(envelope) => {
                let envelope = Arc::new(envelope);
                if let Some(feed) = self.inbound.read().as_ref() {
                    // A dropped receiver only disables the feed.
                    let _ = feed.send(Arc::clone(&envelope));
                }
                self.events.emit(Event::Message(envelope));
            }
            Err(err) => warn!(error = %err, "Dropping undecodable message"),
        }
    }
}

fn lost(err: BotError) -> OpenOutcome {
    OpenOutcome::Lost {
        code: None,
        reason: err.to_string(),
    }
}

async fn send_control(sink: &mut dyn FrameSink, message: &ControlMessage) -> BotResult<()> {
    sink.send(Frame::Text(message.to_text()?)).await
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::EventKind,
        transport::memory::{MemoryConnector, MemoryMode, MemoryServer},
    };

    fn manager(config: ConnectionConfig) -> (ConnectionManager, MemoryServer) {
        let (connector, server) = MemoryConnector::new();
        let url = Url::parse("ws://memory.test/ws?token=t").expect("url");
        let manager =
            ConnectionManager::new(config, url, Arc::new(connector), EventBus::new(64))
                .expect("manager");
        (manager, server)
    }

    #[test]
    fn state_predicates() {
        assert!(
            ConnectionState::Open {
                epoch: ConnectionEpoch(1)
            }
            .is_open()
        );
        assert!(ConnectionState::Failed { attempts: 3 }.is_terminal());
        assert!(ConnectionState::Closed { code: None }.is_terminal());
        assert!(!ConnectionState::Connecting { attempt: 0 }.is_terminal());
    }

    #[test]
    fn outbound_queue_respects_cap() {
        let len = Arc::new(AtomicUsize::new(0));
        let config = ConnectionConfig::new().max_queued_messages(Some(2), QueueOverflow::DropOldest);
        let mut queue = OutboundQueue::new(&config, Arc::clone(&len));
        queue.push("a".to_string());
        queue.push("b".to_string());
        queue.push("c".to_string());
        assert_eq!(len.load(Ordering::Relaxed), 2);
        assert_eq!(queue.pop_front().as_deref(), Some("b"));

        let config = ConnectionConfig::new().max_queued_messages(Some(1), QueueOverflow::DropNewest);
        let mut queue = OutboundQueue::new(&config, Arc::new(AtomicUsize::new(0)));
        queue.push("a".to_string());
        queue.push("b".to_string());
        assert_eq!(queue.pop_front().as_deref(), Some("a"));
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn redacted_url_hides_token() {
        let url = Url::parse("wss://example.com/ws?token=secret").expect("url");
        assert_eq!(redacted(&url), "wss://example.com/ws");
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (manager, mut server) = manager(ConnectionConfig::default());
        manager.connect().await.expect("connect");
        manager.connect().await.expect("second connect");

        assert!(manager.is_open());
        let _peer = server.accept().await.expect("peer");
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test]
    async fn close_is_terminal_and_emits_close() {
        let (manager, mut server) = manager(ConnectionConfig::default());
        let mut events = manager.events().subscribe();
        manager.connect().await.expect("connect");
        let mut peer = server.accept().await.expect("peer");

        manager.close().await.expect("close");

        assert_eq!(
            manager.state(),
            ConnectionState::Closed {
                code: Some(CLOSE_NORMAL)
            }
        );
        assert!(matches!(peer.recv().await, Some(Frame::Close(Some(_)))));
        loop {
            match events.recv().await.expect("event") {
                Event::Close { code } => {
                    assert_eq!(code, Some(CLOSE_NORMAL));
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test]
    async fn close_before_connect_marks_closed() {
        let (manager, _server) = manager(ConnectionConfig::default());
        manager.close().await.expect("close");
        assert!(manager.state().is_terminal());
        assert!(!manager.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_on_hanging_transport() {
        let (manager, server) = manager(
            ConnectionConfig::default().connect_timeout(Duration::from_millis(200)),
        );
        server.set_mode(MemoryMode::Hang);

        let result = manager.connect().await;
        assert!(matches!(result, Err(BotError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_rejects_when_attempts_exhausted() {
        let (manager, server) = manager(
            ConnectionConfig::default()
                .reconnect_max_attempts(2)
                .reconnect_base_delay(Duration::from_millis(10))
                .connect_timeout(Duration::from_secs(5)),
        );
        server.set_mode(MemoryMode::Refuse);

        let result = manager.connect().await;
        assert!(matches!(result, Err(BotError::ReconnectFailed { attempts: 2 })));
        assert_eq!(manager.state(), ConnectionState::Failed { attempts: 2 });
        assert_eq!(server.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_failure_starts_fresh_cycle() {
        let (manager, mut server) = manager(
            ConnectionConfig::default()
                .reconnect_max_attempts(1)
                .reconnect_base_delay(Duration::from_millis(10)),
        );
        server.set_mode(MemoryMode::Refuse);
        assert!(manager.connect().await.is_err());

        server.set_mode(MemoryMode::Accept);
        manager.connect().await.expect("reconnect");
        assert!(manager.is_open());
        assert!(server.accept().await.is_some());
    }

    // A failed driver publishes `Failed` slightly before its task ends.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connect_after_failure_does_not_join_the_exiting_driver() {
        for _ in 0..200 {
            let (manager, mut server) =
                manager(ConnectionConfig::default().reconnect_max_attempts(0));
            server.set_mode(MemoryMode::Refuse);
            assert!(matches!(
                manager.connect().await,
                Err(BotError::ReconnectFailed { attempts: 0 })
            ));

            server.set_mode(MemoryMode::Accept);
            manager.connect().await.expect("fresh cycle");
            assert!(manager.is_open());
            assert!(server.accept().await.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_after_failure_marks_closed() {
        for _ in 0..200 {
            let (manager, server) = manager(ConnectionConfig::default().reconnect_max_attempts(0));
            server.set_mode(MemoryMode::Refuse);
            let mut closes = manager.events().subscribe_kind(EventKind::Close);
            assert!(manager.connect().await.is_err());

            manager.close().await.expect("close");

            assert_eq!(
                manager.state(),
                ConnectionState::Closed {
                    code: Some(CLOSE_NORMAL)
                }
            );
            assert!(matches!(
                closes.recv().await,
                Some(Event::Close {
                    code: Some(CLOSE_NORMAL)
                })
            ));
        }
    }

    #[tokio::test]
    async fn inbound_feed_outlasts_a_lagging_bus() {
        let (connector, mut server) = MemoryConnector::new();
        let url = Url::parse("ws://memory.test/ws").expect("url");
        let events = EventBus::new(1);
        let manager =
            ConnectionManager::new(ConnectionConfig::default(), url, Arc::new(connector), events)
                .expect("manager");
        let mut lagging = manager.events().subscribe();
        let mut feed = manager.inbound_feed();
        manager.connect().await.expect("connect");
        let peer = server.accept().await.expect("peer");

        for i in 0..10 {
            assert!(peer.send_text(format!(r#"{{"Type":"typing","Message":{{"Seq":{i}}}}}"#)));
        }

        for i in 0..10 {
            let envelope = feed.recv().await.expect("envelope");
            assert_eq!(envelope.message["Seq"], i);
        }
        assert!(matches!(
            lagging.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn unsubscribe_sends_control_message_when_open() {
        let (manager, mut server) = manager(ConnectionConfig::default());
        manager.connect().await.expect("connect");
        let mut peer = server.accept().await.expect("peer");

        manager.subscribe("dialog", 5);
        manager.unsubscribe("dialog", 5);
        manager.unsubscribe("dialog", 6);

        let sub: serde_json::Value =
            serde_json::from_str(&peer.recv_text().await.expect("subscribe")).expect("json");
        assert_eq!(sub["command"], "subscribe");
        let unsub: serde_json::Value =
            serde_json::from_str(&peer.recv_text().await.expect("unsubscribe")).expect("json");
        assert_eq!(unsub["command"], "unsubscribe");
        assert_eq!(unsub["thing_id"], 5);

        manager.send("marker");
        assert_eq!(peer.recv_text().await.as_deref(), Some("marker"));
        assert!(manager.subscriptions().is_empty());
    }
}
