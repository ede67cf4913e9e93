//! Common Error Types for keyquorum
//!
//! Provides unified error handling across all modules. Every failure kind
//! that crosses a module boundary has its own variant so callers can react
//! without string matching.

use thiserror::Error;

use crate::storage::traits::StorageError;
use crate::transport::types::TransportError;

/// Root error type for the MPC node
#[derive(Debug, Error)]
pub enum MpcError {
    /// Request failed validation before any work was done
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Discovery returned fewer active participants than the session needs
    #[error("insufficient active participants: need {required}, have {available}")]
    InsufficientNodes { required: usize, available: usize },

    /// Key metadata lookup came back empty
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Session lookup missed both the cache and the durable store
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session insert referenced a key that does not exist
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Inbound protocol queue is full; the sender may retry
    #[error("inbound queue full for session {0}")]
    QueueFull(String),

    /// The local Party rejected a single inbound message
    #[error("party rejected update from {from}: {reason}")]
    PartyUpdateRejected { from: String, reason: String },

    /// One outbound destination could not be reached
    #[error("route failure to {target}: {reason}")]
    RouteFailure { target: String, reason: String },

    /// The multi-round protocol did not finish within its deadline
    #[error("{protocol} timed out after {seconds}s")]
    ProtocolTimeout { protocol: String, seconds: u64 },

    /// GG20 identifiable abort: the protocol failed and named the culprits
    #[error("identifiable abort ({reason}), culprits: {culprits:?}")]
    IdentifiableAbort {
        reason: String,
        culprits: Vec<String>,
    },

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Storage-level failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Key-share vault errors
    #[error("key share error: {0}")]
    KeyShare(#[from] crate::keyshare::KeyShareError),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl MpcError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid-request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether the sender may retry without compromising protocol freshness
    pub fn is_recoverable(&self) -> bool {
        match self {
            MpcError::QueueFull(_) => true,
            MpcError::Transport(e) => e.is_recoverable(),
            MpcError::Storage(StorageError::Connection(_)) => true,
            _ => false,
        }
    }

    /// Stable error code for wire surfaces
    pub fn error_code(&self) -> &'static str {
        match self {
            MpcError::InvalidRequest(_) => "INVALID_REQUEST",
            MpcError::InsufficientNodes { .. } => "INSUFFICIENT_NODES",
            MpcError::KeyNotFound(_) => "KEY_NOT_FOUND",
            MpcError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            MpcError::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            MpcError::QueueFull(_) => "QUEUE_FULL",
            MpcError::PartyUpdateRejected { .. } => "PARTY_UPDATE_REJECTED",
            MpcError::RouteFailure { .. } => "ROUTE_FAILURE",
            MpcError::ProtocolTimeout { .. } => "PROTOCOL_TIMEOUT",
            MpcError::IdentifiableAbort { .. } => "IDENTIFIABLE_ABORT",
            MpcError::Transport(_) => "TRANSPORT_ERROR",
            MpcError::Storage(_) => "STORAGE_ERROR",
            MpcError::Config(_) => "CONFIG_ERROR",
            MpcError::KeyShare(_) => "KEY_SHARE_ERROR",
            MpcError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias using MpcError
pub type Result<T> = std::result::Result<T, MpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = MpcError::invalid("threshold too small");
        assert_eq!(err.error_code(), "INVALID_REQUEST");
        assert!(err.to_string().contains("threshold too small"));

        let err = MpcError::InsufficientNodes {
            required: 3,
            available: 2,
        };
        assert_eq!(err.error_code(), "INSUFFICIENT_NODES");
    }

    #[test]
    fn test_recoverable() {
        assert!(MpcError::QueueFull("s-1".into()).is_recoverable());
        assert!(!MpcError::KeyNotFound("k-1".into()).is_recoverable());
        assert!(!MpcError::ProtocolTimeout {
            protocol: "gg18".into(),
            seconds: 60,
        }
        .is_recoverable());
    }
}
