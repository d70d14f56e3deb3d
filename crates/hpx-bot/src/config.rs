//! Client and connection configuration.

use std::time::Duration;

use url::Url;

use crate::{
    error::{BotError, BotResult},
    reconnect::BackoffConfig,
};

/// What to do when a capped outbound queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueOverflow {
    /// Evict the oldest queued payload to make room.
    #[default]
    DropOldest,
    /// Discard the payload being sent.
    DropNewest,
}

/// Configuration for the connection manager.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    // Reconnection settings
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Maximum number of consecutive reconnection attempts.
    pub reconnect_max_attempts: u32,
    /// Random jitter factor (0.0-1.0) for reconnection delays.
    pub reconnect_jitter: f64,

    // Heartbeat settings
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Maximum time to wait for pong response.
    pub pong_timeout: Duration,

    // Connection
    /// Timeout for a single connection attempt and for `connect()`.
    pub connect_timeout: Duration,

    // Channels
    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,

    // Outbound queue
    /// Maximum number of payloads held while disconnected (None = unbounded).
    pub max_queued_messages: Option<usize>,
    /// Overflow policy when `max_queued_messages` is reached.
    pub queue_overflow: QueueOverflow,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_backoff_factor: 2.0,
            reconnect_max_attempts: 5,
            reconnect_jitter: 0.0,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            event_channel_capacity: 256,
            max_queued_messages: None,
            queue_overflow: QueueOverflow::DropOldest,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first reconnection attempt.
    #[must_use]
    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the maximum reconnection attempts.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set the reconnection jitter factor.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Cap the outbound queue and choose what happens on overflow.
    #[must_use]
    pub fn max_queued_messages(mut self, max: Option<usize>, overflow: QueueOverflow) -> Self {
        self.max_queued_messages = max;
        self.queue_overflow = overflow;
        self
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.backoff().validate()?;
        if self.ping_interval.is_zero() {
            return Err("Ping interval must be > 0".to_string());
        }
        if self.pong_timeout.is_zero() {
            return Err("Pong timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err("Event channel capacity must be > 0".to_string());
        }
        if self.max_queued_messages == Some(0) {
            return Err("Max queued messages must be > 0 when set".to_string());
        }
        Ok(())
    }
}

/// Top-level client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Real-time endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Access token appended to the endpoint as the `token` query parameter.
    pub token: String,
    /// Prefix that marks a message as a command.
    pub prefix: String,
    /// Connection manager settings.
    pub connection: ConnectionConfig,
}

impl ClientConfig {
    /// Create a new configuration for the given endpoint and token.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            prefix: "/".to_string(),
            connection: ConnectionConfig::default(),
        }
    }

    /// Set the command prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Check the token shape. Runs before any I/O.
    pub fn validate_token(&self) -> BotResult<()> {
        if self.token.trim().is_empty() {
            return Err(BotError::token("Token cannot be empty"));
        }
        if self
            .token
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(BotError::token(
                "Token must not contain whitespace or control characters",
            ));
        }
        Ok(())
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> BotResult<()> {
        self.validate_token()?;
        if self.prefix.is_empty() {
            return Err(BotError::config("Command prefix cannot be empty"));
        }
        self.connection.validate().map_err(BotError::config)?;
        self.endpoint().map(|_| ())
    }

    /// The endpoint URL with the token attached.
    pub fn endpoint(&self) -> BotResult<Url> {
        if self.url.is_empty() {
            return Err(BotError::config("URL cannot be empty"));
        }
        let mut url = Url::parse(&self.url)
            .map_err(|e| BotError::config(format!("Invalid URL {}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(BotError::config(format!(
                "Unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }
}
