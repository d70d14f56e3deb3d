//! Error taxonomy for the bot runtime.
//!
//! Connection-level faults ([`BotError::WebSocket`]) are recovered locally by
//! the connection manager; per-message faults ([`CommandError`],
//! [`MiddlewareError`]) are isolated to the message that produced them.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the crate.
pub type BotResult<T> = Result<T, BotError>;

/// Boxed error returned by application handlers and collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for client operations.
#[derive(Error, Debug)]
pub enum BotError {
    /// The access token was rejected before any I/O happened.
    #[error("Token validation error: {message}")]
    TokenValidation { message: String },

    /// Transport-level failure. Drives the reconnect path.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The connection was closed.
    #[error("Connection closed: {}", reason.as_deref().unwrap_or("no reason"))]
    ConnectionClosed { reason: Option<String> },

    /// Reconnect attempts were exhausted.
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },

    /// Error returned by a REST collaborator.
    #[error(transparent)]
    Api(#[from] ApiRequestError),

    /// Command resolution or argument parsing error.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Middleware registration or execution error.
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BotError {
    /// Create a token validation error.
    pub fn token(message: impl Into<String>) -> Self {
        Self::TokenValidation {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error came from the transport and should trigger a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WebSocket { .. } | Self::ConnectionClosed { .. } | Self::Timeout { .. }
        )
    }
}

/// Errors surfaced by REST collaborators ([`crate::UserFetch`], [`crate::MessageSend`]).
#[derive(Error, Debug)]
pub enum ApiRequestError {
    /// The requested resource does not exist.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// The service answered with a non-success status.
    #[error("API error: status={status}, body={body}")]
    Status { status: u16, body: String },

    /// The request could not be performed.
    #[error("Request failed: {message}")]
    Request { message: String },
}

impl ApiRequestError {
    /// Create a not-found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a generic request error.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised while registering, resolving or invoking commands.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Command name is empty or contains whitespace.
    #[error("Invalid command name: {name:?}")]
    InvalidName { name: String },

    /// A command with this name is already registered.
    #[error("Command already registered: {name}")]
    DuplicateCommand { name: String },

    /// An alias was added for a command that does not exist.
    #[error("Cannot alias {alias} to unknown command {command}")]
    UnknownAliasTarget { alias: String, command: String },

    /// Neither an alias nor a command matched.
    #[error("Unknown command: {name}")]
    CommandNotFound { name: String, text: String },

    /// The invoking user is still cooling down.
    #[error("Command {command} is on cooldown for another {remaining:?}")]
    CommandOnCooldown { command: String, remaining: Duration },

    /// A required argument had no token left.
    #[error("Missing required argument: {name}")]
    MissingArgument { name: String },

    /// Token could not be parsed as an integer.
    #[error("Argument {name} must be an integer, got {value:?}")]
    InvalidInteger { name: String, value: String },

    /// Token could not be parsed as a float.
    #[error("Argument {name} must be a number, got {value:?}")]
    InvalidFloat { name: String, value: String },

    /// Token is not one of the accepted boolean spellings.
    #[error("Argument {name} must be a boolean, got {value:?}")]
    InvalidBoolean { name: String, value: String },

    /// The user lookup found nobody with this tag.
    #[error("User not found for argument {name}: {tag}")]
    UserNotFound { name: String, tag: String },

    /// The user lookup itself failed.
    #[error("User lookup failed for argument {name}: {source}")]
    UserLookup {
        name: String,
        #[source]
        source: ApiRequestError,
    },

    /// A `repost` argument was declared but the message carries no repost.
    #[error("Argument {name} requires a reposted message")]
    MissingRepost { name: String },

    /// The schema names a type outside the supported set.
    #[error("Unknown argument type: {kind}")]
    UnknownArgumentType { kind: String },

    /// The schema could not be normalized.
    #[error("Invalid argument schema: {message}")]
    InvalidSchema { message: String },

    /// The bound handler returned an error.
    #[error("Handler for {command} failed: {source}")]
    Handler {
        command: String,
        #[source]
        source: BoxError,
    },
}

impl CommandError {
    /// Remaining cooldown in milliseconds, if this is a cooldown error.
    pub fn remaining_ms(&self) -> Option<u64> {
        match self {
            Self::CommandOnCooldown { remaining, .. } => {
                Some(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        }
    }

    /// Returns true if no command matched.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CommandNotFound { .. })
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }
}

/// Errors raised by the middleware pipeline.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    /// A middleware with this name is already registered.
    #[error("Middleware already registered: {name}")]
    Duplicate { name: String },

    /// Middleware returned an error.
    #[error("Middleware failed: {message}")]
    Failed { message: String },

    /// Middleware panicked while running.
    #[error("Middleware {name} panicked")]
    Panicked { name: String },
}

impl MiddlewareError {
    /// Create a failed middleware error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}
