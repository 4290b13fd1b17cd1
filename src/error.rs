//! Error types for Skylink.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::types::{ChannelId, ConnectionState, LinkId};

/// Result type alias for Skylink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Skylink.
#[derive(Error, Debug)]
pub enum Error {
    // Channel pool errors
    #[error("no more vehicle slots available: requested {requested} channel(s), {available} free")]
    ChannelExhausted { requested: usize, available: usize },

    #[error("channel {0} is not assigned (double free)")]
    ChannelNotAssigned(ChannelId),

    // Link lifecycle errors
    #[error("failed to open transport for link {link}: {reason}")]
    TransportOpenFailed { link: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("connect aborted by disconnect")]
    ConnectionAborted,

    #[error("link is not connected")]
    NotConnected,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("vehicle reference count is already zero")]
    ReferenceUnderflow,

    // Manager errors
    #[error("link {0} is busy (connected or referenced)")]
    LinkBusy(LinkId),

    #[error("link {0} not found")]
    LinkNotFound(LinkId),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("UDP error: {0}")]
    Udp(String),

    #[error("TCP error: {0}")]
    Tcp(String),

    #[error("log replay error: {0}")]
    Replay(String),

    #[error("mock transport error: {0}")]
    Mock(String),

    #[error("transport closed")]
    Closed,
}

impl Error {
    /// Check if the condition is transient and the caller may retry later.
    ///
    /// The link layer itself never retries; this only informs the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ChannelExhausted { .. }
                | Error::ConnectionTimeout
                | Error::TransportOpenFailed { .. }
                | Error::Transport(
                    TransportError::SendFailed(_) | TransportError::ReceiveFailed(_)
                )
                | Error::Io(_)
        )
    }

    /// Check if the error indicates a bug in the caller rather than a runtime condition.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            Error::ChannelNotAssigned(_)
                | Error::ReferenceUnderflow
                | Error::InvalidStateTransition { .. }
        )
    }

    /// Short title used when this error is announced as a communication error.
    pub fn title(&self) -> &'static str {
        match self {
            Error::ChannelExhausted { .. } => "Link Error",
            Error::ConnectionTimeout => "Connection Timeout",
            Error::TransportOpenFailed { .. } => "Connection Failed",
            Error::Transport(_) | Error::Io(_) => "Communication Error",
            _ => "Link Error",
        }
    }
}

/// Error context for debugging.
#[derive(Debug)]
pub struct ErrorContext {
    pub link: Option<String>,
    pub channel: Option<ChannelId>,
    pub operation: String,
    pub timestamp: std::time::Instant,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            link: None,
            channel: None,
            operation: operation.into(),
            timestamp: std::time::Instant::now(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation={}", self.operation)?;
        if let Some(ref link) = self.link {
            write!(f, ", link={link}")?;
        }
        if let Some(channel) = self.channel {
            write!(f, ", channel={channel}")?;
        }
        Ok(())
    }
}
