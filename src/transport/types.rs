//! Transport Wire Types
//!
//! JSON bodies for the node-to-node RPC surface and the coordinator-facing
//! session API. Protocol payloads travel hex-encoded; frames are capped at
//! 10 MiB.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Protocol;
use crate::types::key::{Algorithm, Curve};
use crate::types::session::SessionStatus;

/// Maximum protocol frame size
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),

    #[error("peer {0} could not be resolved through discovery")]
    PeerUnresolved(String),

    #[error("payload of {0} bytes exceeds the 10 MiB frame limit")]
    PayloadTooLarge(usize),

    #[error("remote error {code}: {message}")]
    Remote {
        code: String,
        message: String,
        recoverable: bool,
    },

    #[error("tls error: {0}")]
    Tls(String),
}

impl TransportError {
    /// Whether the sender may retry without protocol compromise
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Http(_) => true,
            TransportError::PeerUnresolved(_) => true,
            TransportError::Remote { recoverable, .. } => *recoverable,
            TransportError::PayloadTooLarge(_) | TransportError::Tls(_) => false,
        }
    }
}

/// Error body returned by every RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recoverable,
        }
    }
}

/// One DKG round message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenMessageRequest {
    pub session_id: String,
    pub from_node_id: String,
    /// Hex-encoded protocol bytes
    pub payload: String,
    pub is_broadcast: bool,
}

/// One signing round message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningMessageRequest {
    pub session_id: String,
    pub from_node_id: String,
    /// Hex-encoded protocol bytes
    pub payload: String,
    #[serde(default)]
    pub is_broadcast: bool,
}

/// Ack for unary message sends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub accepted: bool,
    pub message: String,
}

/// Leader kick: begin DKG for a key on the receiving node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDkgRequest {
    pub key_id: String,
    pub algorithm: Algorithm,
    pub curve: Curve,
    pub threshold: usize,
    pub total_nodes: usize,
    pub node_ids: Vec<String>,
    /// Optional explicit protocol; the session's tag is used when absent
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

/// StartDKG result; `started` is false when the run could not be scheduled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDkgResponse {
    pub started: bool,
    pub message: String,
}

/// Liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    /// Sender clock, unix seconds
    pub sent_at: u64,
    #[serde(default)]
    pub status_info: HashMap<String, String>,
}

/// Liveness reply with a clock echo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub alive: bool,
    pub coordinator_id: String,
    pub received_at: u64,
    #[serde(default)]
    pub instructions: HashMap<String, String>,
}

/// Coordinator-facing: create a DKG session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDkgSessionRequest {
    pub key_id: String,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    pub algorithm: Algorithm,
    pub curve: Curve,
    pub threshold: usize,
    pub total_nodes: usize,
    /// Used verbatim when non-empty; otherwise discovery picks participants
    #[serde(default)]
    pub node_ids: Vec<String>,
}

/// Coordinator-facing: create a signing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSigningSessionRequest {
    pub key_id: String,
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

/// Kick local signing for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    /// Hex-encoded message to sign, `0x` prefix tolerated
    pub message_hex: String,
    /// Signing subset; the session's participant list when empty
    #[serde(default)]
    pub node_ids: Vec<String>,
}

/// Signature returned by the signing kick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    pub session_id: String,
    pub r: String,
    pub s: String,
    /// Canonical encoding (DER or r||s), hex
    pub signature: String,
    pub public_key: String,
}

/// Frames of the bidirectional session stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStreamMessage {
    /// First client frame
    JoinRequest { session_id: String, node_id: String },
    /// First server reply
    Confirmation {
        session_id: String,
        status: SessionStatus,
        threshold: usize,
        total_nodes: usize,
        participants: Vec<String>,
        current_round: u32,
        confirmed_at: u64,
    },
    /// Protocol payload frame
    ShareMessage {
        /// Hex-encoded protocol bytes
        share_data: String,
        /// Round number; -1 flags a broadcast frame
        round: i32,
        submitted_at: u64,
    },
    HeartbeatRequest { node_id: String },
    HeartbeatAck { alive: bool, received_at: u64 },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}
