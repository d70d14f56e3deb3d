//! # hpx-bot
//!
//! Client runtime for chat bots that live on a real-time event service.
//!
//! The crate keeps one durable connection alive and turns prefixed chat
//! messages into typed command invocations.
//!
//! ## Features
//!
//! - **Self-healing connection**: exponential backoff, heartbeat with pong
//!   timeout, outbound queue while offline, subscription replay on reconnect
//! - **Middleware**: prioritized, fault-isolated chain run on every envelope
//! - **Commands**: aliases, per-user cooldowns, typed arguments (`string`,
//!   `int`, `float`, `boolean`, `user`, `repost`) with rest capture
//! - **Typed events**: one [`Event`] enum on a broadcast [`EventBus`]
//! - **Pluggable transport**: WebSocket via `tokio-tungstenite`, or the
//!   in-memory transport for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hpx_bot::{
//!     Args, BotClient, BoxError, ClientConfig, ClientContext, CommandContext,
//!     command::ArgSchema,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("wss://chat.example.com/ws", "my-token").prefix("!");
//!     let client = BotClient::websocket(config, ClientContext::new())?;
//!
//!     client.register_command(
//!         "echo",
//!         ArgSchema::from_json(r#"{"text": ["string", null, "rest"]}"#)?,
//!         |ctx: CommandContext, args: Args| async move {
//!             ctx.reply(args.str("text").unwrap_or_default()).await?;
//!             Ok::<(), BoxError>(())
//!         },
//!     )?;
//!
//!     client.start().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod envelope;
pub mod error;
pub mod events;
pub mod middleware;
mod reconnect;
pub mod subscription;
pub mod transport;

pub use client::BotClient;
pub use collaborators::{MessageSend, SendRequest, UserDirectory, UserFetch};
pub use command::{Args, ArgValue, CommandContext, CommandHandler, CommandResolver};
pub use config::{ClientConfig, ConnectionConfig, QueueOverflow};
pub use connection::{ConnectionEpoch, ConnectionManager, ConnectionState};
pub use context::ClientContext;
pub use envelope::{ChatMessage, ControlMessage, Envelope, User};
pub use error::{ApiRequestError, BotError, BotResult, BoxError, CommandError, MiddlewareError};
pub use events::{Event, EventBus, EventKind};
pub use middleware::{DispatchPipeline, Middleware, MiddlewareConfig, middleware_fn};
pub use subscription::Subscription;
