//! Unified error handling for swarm-channels.
//!
//! Router errors are sentinel values the embedding transport layer maps to
//! status codes (404/403/409). Replication errors never reach the mutating
//! caller; they are logged and swallowed at the replication boundary.

use thiserror::Error;

/// Errors returned by Router operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("channel not found")]
    ChannelNotFound,

    #[error("channel already exists")]
    ChannelExists,

    #[error("caller is not a party to this channel")]
    Unauthorized,
}

impl RouterError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ChannelNotFound => "channel_not_found",
            Self::ChannelExists => "channel_exists",
            Self::Unauthorized => "unauthorized",
        }
    }
}

/// Result type for Router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors surfaced by the cluster broadcast transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("transport closed")]
    Closed,
}

/// Errors occurring while propagating a mutation to peers.
///
/// These are reported at the replication boundary and never propagate to
/// the original `append`/`create` caller: a write that succeeded locally
/// stays acknowledged.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ReplicationError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Encode(_) => "encode",
            Self::Transport(_) => "transport",
        }
    }
}
