//! Transport abstraction used by the connection manager.
//!
//! The manager never touches raw socket I/O. It asks a [`Connector`] for a
//! fresh pair of halves on every connection attempt:
//!
//! - a [`FrameSink`] for outbound frames, and
//! - a [`FrameStream`] of inbound frames, which ends when the peer goes away.
//!
//! Dropping both halves without calling [`FrameSink::close`] is a hard
//! close: no close frame is sent.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use url::Url;

use crate::error::BotResult;

pub mod memory;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

/// Normal closure status code.
pub const CLOSE_NORMAL: u16 = 1000;

/// A transport-level frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
    /// Heartbeat probe.
    Ping(Bytes),
    /// Heartbeat answer.
    Pong(Bytes),
    /// Peer-initiated close.
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Create a text frame.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Get as text if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for ping and pong frames.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_))
    }
}

/// Close code and reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code.
    pub code: u16,
    /// Human readable reason.
    pub reason: String,
}

/// Inbound half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = BotResult<Frame>> + Send>>;

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a single frame.
    async fn send(&mut self, frame: Frame) -> BotResult<()>;

    /// Gracefully close with a code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> BotResult<()>;
}

/// Both halves of an established transport.
pub struct TransportParts {
    /// Outbound half.
    pub sink: Box<dyn FrameSink>,
    /// Inbound half.
    pub stream: FrameStream,
}

/// Opens transports. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport to `url`.
    async fn connect(&self, url: &Url) -> BotResult<TransportParts>;
}
