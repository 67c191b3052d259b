//! Client error types

use crate::message::MessageError;
use crate::transport::TransportError;
use thiserror::Error;

/// Discriminant of a [`ClientError`].
///
/// Callers match on this instead of on the error value itself when they only
/// care about which failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RelayAlreadyRegistered,
    SubscriptionAlreadyExist,
    ConnectFailed,
    ConnectionClosed,
    NotOpen,
    InvalidUrl,
    PoolClosed,
    NotRegistered,
    AlreadyConnected,
    Transport,
    Message,
}

/// Client error type
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// A relay with the same normalized URL is already in the pool
    #[error("relay already registered: {0}")]
    RelayAlreadyRegistered(String),

    /// A subscription with this id is still active
    #[error("subscription already exists: {0}")]
    SubscriptionAlreadyExist(String),

    /// The connect attempt failed before the relay opened
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    /// The WebSocket closed
    #[error("WebSocket closed: {0}")]
    ConnectionClosed(String),

    /// Send attempted on a relay that is not open
    #[error("relay is not open: {0}")]
    NotOpen(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The pool has been closed
    #[error("connection pool is closed")]
    PoolClosed,

    /// No relay with this URL is in the pool
    #[error("relay not registered: {0}")]
    NotRegistered(String),

    /// Already connected
    #[error("Already connected to relay: {0}")]
    AlreadyConnected(String),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol message error
    #[error("Message error: {0}")]
    Message(String),
}

impl ClientError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::RelayAlreadyRegistered(_) => ErrorKind::RelayAlreadyRegistered,
            ClientError::SubscriptionAlreadyExist(_) => ErrorKind::SubscriptionAlreadyExist,
            ClientError::ConnectFailed(_) => ErrorKind::ConnectFailed,
            ClientError::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            ClientError::NotOpen(_) => ErrorKind::NotOpen,
            ClientError::InvalidUrl(_) => ErrorKind::InvalidUrl,
            ClientError::PoolClosed => ErrorKind::PoolClosed,
            ClientError::NotRegistered(_) => ErrorKind::NotRegistered,
            ClientError::AlreadyConnected(_) => ErrorKind::AlreadyConnected,
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::Message(_) => ErrorKind::Message,
        }
    }

    /// True for failures that mean the relay could not be (or stay) connected.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectFailed | ErrorKind::ConnectionClosed | ErrorKind::Transport
        )
    }
}

impl From<MessageError> for ClientError {
    fn from(err: MessageError) -> Self {
        ClientError::Message(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
