//! WebSocket transport backed by `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::SplitSink,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Message,
        protocol::{CloseFrame as WsCloseFrame, frame::coding::CloseCode},
    },
};
use tracing::debug;
use url::Url;

use super::{CloseFrame, Connector, Frame, FrameSink, TransportParts};
use crate::error::{BotError, BotResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector that opens real WebSocket connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Create a new connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> BotResult<TransportParts> {
        debug!(host = url.host_str().unwrap_or_default(), "Opening WebSocket");
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| BotError::websocket(e.to_string()))?;
        let (write, read) = ws.split();

        let stream = read.filter_map(|result| async move {
            match result {
                Ok(message) => from_message(message).map(Ok),
                Err(err) => Some(Err(BotError::websocket(err.to_string()))),
            }
        });

        Ok(TransportParts {
            sink: Box::new(TungsteniteSink { inner: write }),
            stream: Box::pin(stream),
        })
    }
}

struct TungsteniteSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: Frame) -> BotResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(data) => Message::binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(close) => Message::Close(close.map(to_close_frame)),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| BotError::websocket(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> BotResult<()> {
        let frame = to_close_frame(CloseFrame {
            code,
            reason: reason.to_string(),
        });
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| BotError::websocket(e.to_string()))?;
        self.inner
            .close()
            .await
            .map_err(|e| BotError::websocket(e.to_string()))
    }
}

fn to_close_frame(close: CloseFrame) -> WsCloseFrame {
    WsCloseFrame {
        code: CloseCode::from(close.code),
        reason: close.reason.into(),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(close) => Some(Frame::Close(close.map(|frame| CloseFrame {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned(),
        }))),
        Message::Frame(_) => None,
    }
}
