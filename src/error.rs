//! Error types shared by the protocol layer, the reconciler and the scheduler.

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed or unexpected server line, or a tagged NO/BAD completion.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The IMAP session is already held by another operation.
    #[error("service unavailable: IMAP session already in use")]
    ServiceUnavailable,

    #[error("server lacks required capability {0}")]
    Capability(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl SyncError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Errors after which the cached connection can no longer be trusted.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Protocol(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
