//! Echo bot
//!
//! Connects to a real-time chat service and answers `!echo <text>` and
//! `!ping`. Replies are printed instead of posted, since posting belongs to
//! the application's REST client.
//!
//! Run with:
//! `HPX_BOT_URL=wss://chat.example.com/ws HPX_BOT_TOKEN=... cargo run -p hpx-bot --example echo_bot`

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hpx_bot::{
    ApiRequestError, Args, BotClient, BoxError, ChatMessage, ClientConfig, ClientContext,
    CommandContext, ConnectionConfig, Event, EventKind, MessageSend, MiddlewareConfig,
    SendRequest,
    command::{ArgSchema, CommandDefinition},
    middleware_fn,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Prints replies to stdout.
struct StdoutSender;

#[async_trait]
impl MessageSend for StdoutSender {
    async fn send(&self, request: SendRequest) -> Result<ChatMessage, ApiRequestError> {
        println!("[dialog {}] {}", request.dialog_id, request.text);
        Ok(ChatMessage {
            dialog_id: request.dialog_id,
            text: request.text,
            ..ChatMessage::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hpx_bot=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let url = std::env::var("HPX_BOT_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".into());
    let token = std::env::var("HPX_BOT_TOKEN")?;

    let config = ClientConfig::new(url, token).prefix("!").connection(
        ConnectionConfig::default()
            .reconnect_base_delay(Duration::from_millis(500))
            .reconnect_max_attempts(20),
    );
    let context = ClientContext::new().with_message_send(Arc::new(StdoutSender));
    let client = BotClient::websocket(config, context)?;

    client.use_middleware(
        middleware_fn(|envelope| {
            tracing::debug!(kind = %envelope.kind, "Inbound envelope");
            Ok(())
        }),
        MiddlewareConfig::new().name("trace").priority(100),
    )?;

    client.register_command(
        "echo",
        ArgSchema::from_json(r#"{"text": ["string", null, "rest"]}"#)?,
        |ctx: CommandContext, args: Args| async move {
            ctx.reply(args.str("text").unwrap_or_default()).await?;
            Ok::<(), BoxError>(())
        },
    )?;
    client.register(
        CommandDefinition::new("ping", |ctx: CommandContext, _args: Args| async move {
            ctx.reply("pong").await?;
            Ok::<(), BoxError>(())
        })
        .description("Liveness check")
        .cooldown(Duration::from_secs(5)),
    )?;
    client.add_alias("p", "ping")?;

    let mut failures = client.events().subscribe_kind(EventKind::CommandFailed);
    tokio::spawn(async move {
        while let Some(event) = failures.recv().await {
            if let Event::CommandFailed { command, error, .. } = event {
                warn!(%command, %error, "Command failed");
            }
        }
    });

    client.start().await?;
    info!(commands = ?client.get_commands(), "Echo bot running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    client.stop().await?;
    Ok(())
}
