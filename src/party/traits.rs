//! Party Contract
//!
//! The threshold cryptography library is a black box behind these traits: a
//! Party is started once, fed inbound round messages, emits outbound
//! messages on its channel, and terminates with save data (keygen) or a
//! signature (signing).

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::identity::PartyId;
use crate::types::key::Curve;

/// Errors raised by a Party or its factory
#[derive(Debug, Error)]
pub enum PartyError {
    /// The party already consumed a message from this sender for this round
    #[error("duplicate message from {0}")]
    Duplicate(String),

    /// The message could not be applied in the party's current state
    #[error("rejected: {0}")]
    Rejected(String),

    /// Outbound or terminal channel is gone
    #[error("party channel closed")]
    ChannelClosed,

    /// The protocol run failed; culprits are populated for variants with
    /// identifiable abort
    #[error("protocol failed: {reason}")]
    Failed {
        reason: String,
        culprits: Vec<String>,
    },
}

pub type PartyResult<T> = Result<T, PartyError>;

/// One outbound message produced by a Party
///
/// An empty `to` list means broadcast to every other participant.
#[derive(Debug, Clone)]
pub struct PartyMessage {
    pub payload: Vec<u8>,
    pub to: Vec<PartyId>,
}

/// Public key point produced by DKG, prior to wire encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyPoint {
    /// Affine coordinates, big-endian, left-padded to 32 bytes
    Secp256k1 { x: [u8; 32], y: [u8; 32] },
    /// Y coordinate big-endian plus the parity of X
    Ed25519 { y: [u8; 32], x_is_odd: bool },
}

/// Terminal result of a keygen Party
#[derive(Debug, Clone)]
pub struct KeygenOutput {
    pub public_key: PublicKeyPoint,
    /// This node's secret share, left-padded to the scalar size
    pub secret_share: Vec<u8>,
    /// Position in the sorted participant list, 1-based
    pub share_index: u32,
}

/// Terminal result of a signing Party
#[derive(Debug, Clone)]
pub struct SigningOutput {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// The black-box multi-round state machine
pub trait Party: Send + Sync {
    /// Kick off round 1; emits the first messages on the outbound channel
    fn start(&self) -> PartyResult<()>;

    /// Apply one inbound round message from a peer
    fn update_from_bytes(
        &self,
        payload: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> PartyResult<()>;
}

/// Construction parameters for a keygen Party
#[derive(Debug, Clone)]
pub struct KeygenParams {
    pub key_id: String,
    /// All participants, sorted
    pub parties: Vec<PartyId>,
    pub this_party: PartyId,
    pub threshold: usize,
    pub curve: Curve,
}

/// Construction parameters for a signing Party
#[derive(Debug, Clone)]
pub struct SigningParams {
    pub session_id: String,
    pub key_id: String,
    /// The signing subset, sorted
    pub parties: Vec<PartyId>,
    pub this_party: PartyId,
    pub message: Vec<u8>,
    /// This node's secret share from the vault
    pub secret_share: Vec<u8>,
    pub curve: Curve,
}

/// Builds Parties wired to their outbound and terminal channels
pub trait PartyFactory: Send + Sync {
    fn new_keygen_party(
        &self,
        params: KeygenParams,
        out: mpsc::Sender<PartyMessage>,
        end: oneshot::Sender<PartyResult<KeygenOutput>>,
    ) -> PartyResult<Arc<dyn Party>>;

    fn new_signing_party(
        &self,
        params: SigningParams,
        out: mpsc::Sender<PartyMessage>,
        end: oneshot::Sender<PartyResult<SigningOutput>>,
    ) -> PartyResult<Arc<dyn Party>>;
}
