//! In-process transport.
//!
//! [`MemoryConnector`] hands every accepted connection to a [`MemoryServer`]
//! as a [`MemoryPeer`], which can observe outbound frames and inject inbound
//! frames, closes and errors. Used by the test suite and handy for
//! exercising bots without a network.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{CloseFrame, Connector, Frame, FrameSink, TransportParts};
use crate::error::{BotError, BotResult};

/// How the connector answers connection attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemoryMode {
    /// Accept and hand the connection to the server side.
    #[default]
    Accept,
    /// Fail immediately.
    Refuse,
    /// Never complete.
    Hang,
}

struct Shared {
    mode: Mutex<MemoryMode>,
    attempts: AtomicU32,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Client side of the in-process transport.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

/// Server side of the in-process transport.
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Create a connector and the server that receives its connections.
    pub fn new() -> (Self, MemoryServer) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            mode: Mutex::new(MemoryMode::Accept),
            attempts: AtomicU32::new(0),
            peers: peers_tx,
        });
        let server = MemoryServer {
            peers: peers_rx,
            shared: Arc::clone(&shared),
        };
        (Self { shared }, server)
    }
}

impl MemoryServer {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Change how future connection attempts are answered.
    pub fn set_mode(&self, mode: MemoryMode) {
        *self.shared.mode.lock() = mode;
    }

    /// Number of connection attempts seen so far, including refused ones.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &Url) -> BotResult<TransportParts> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.shared.mode.lock();
        match mode {
            MemoryMode::Refuse => return Err(BotError::websocket("Connection refused")),
            MemoryMode::Hang => std::future::pending::<()>().await,
            MemoryMode::Accept => {}
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<BotResult<Frame>>();

        let peer = MemoryPeer {
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        self.shared
            .peers
            .send(peer)
            .map_err(|_| BotError::websocket("Memory server dropped"))?;

        let stream = futures_util::stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(TransportParts {
            sink: Box::new(MemorySink {
                outbound: outbound_tx,
            }),
            stream: Box::pin(stream),
        })
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> BotResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| BotError::websocket("Peer went away"))
    }

    async fn close(&mut self, code: u16, reason: &str) -> BotResult<()> {
        self.send(Frame::Close(Some(CloseFrame {
            code,
            reason: reason.to_string(),
        })))
        .await
    }
}

/// Server-side view of one connection.
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<BotResult<Frame>>,
}

impl MemoryPeer {
    /// Next frame sent by the client. `None` once the client dropped its sink.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next text frame sent by the client, skipping heartbeat frames.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.outbound.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Ping(_) | Frame::Pong(_) => {}
                Frame::Binary(data) => return Some(String::from_utf8_lossy(&data).into_owned()),
                Frame::Close(_) => return None,
            }
        }
    }

    /// Frame sent by the client, if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    /// Deliver a frame to the client.
    pub fn send(&self, frame: Frame) -> bool {
        self.inbound.send(Ok(frame)).is_ok()
    }

    /// Deliver a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Answer a heartbeat.
    pub fn send_pong(&self) -> bool {
        self.send(Frame::Pong(Bytes::new()))
    }

    /// Deliver a transport error to the client.
    pub fn send_error(&self, message: impl Into<String>) -> bool {
        self.inbound.send(Err(BotError::websocket(message))).is_ok()
    }

    /// Close from the server side with a close frame.
    pub fn close(self, code: u16, reason: impl Into<String>) {
        let _ = self.inbound.send(Ok(Frame::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))));
    }
}
