//! Error types for Mailroom.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

impl Error {
    /// Whether the error must stop the process rather than be retried or
    /// isolated to a single message.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Session(e) => e.is_fatal(),
            Self::Store(_) | Self::Handler(_) | Self::Send(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a mail protocol session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Login rejected, or connecting kept failing until attempts ran out.
    #[error("Authentication failed after {attempts} attempt(s): {reason}")]
    Auth { attempts: u32, reason: String },

    /// The server answered with something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command completed with a non-OK status.
    #[error("Command {command} failed: {status} {detail}")]
    CommandFailed {
        command: String,
        status: String,
        detail: String,
    },

    /// Network-level failure; the session must be rebuilt.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("No active session")]
    NotConnected,
}

impl SessionError {
    /// `Auth` is the only session error the engine cannot recover from by
    /// reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Failure reported by a message handler for a single message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Message {message_id} rejected: {reason}")]
    Rejected { message_id: String, reason: String },

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sent {message_id} but could not link it into thread {thread_id}: {source}")]
    Link {
        message_id: String,
        thread_id: String,
        #[source]
        source: StoreError,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
