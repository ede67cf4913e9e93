//! Deterministic In-Process Party
//!
//! A stand-in for the external threshold library used by tests and local
//! development. It runs a real two-round commit/share exchange over the
//! transport, then terminates with key material derived deterministically
//! from the participant set, so every node arrives at the same public key
//! and signatures verify under the real curve parsers.
//!
//! Every signer derives the full group secret, so any subset of signers
//! produces the identical signature. A production deployment plugs an actual
//! MPC library in through [`PartyFactory`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use k256::ecdsa::signature::Signer as _;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use super::traits::{
    KeygenOutput, KeygenParams, Party, PartyError, PartyFactory, PartyMessage, PartyResult,
    PublicKeyPoint, SigningOutput, SigningParams,
};
use crate::identity::PartyId;
use crate::types::key::Curve;

const COMMIT_PREFIX: &str = "kq-commit";
const SHARE_PREFIX: &str = "kq-share";

/// Derive the deterministic group secret for a key and participant set
fn derive_group_secret(curve: Curve, key_id: &str, parties: &[PartyId]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"keyquorum-local-party-v1");
    hasher.update(key_id.as_bytes());
    for party in parties {
        hasher.update(party.id.as_bytes());
        hasher.update(b"|");
    }
    let mut seed: [u8; 32] = hasher.finalize().into();

    if curve == Curve::Secp256k1 {
        // rehash until the seed is a valid scalar
        while k256::ecdsa::SigningKey::from_bytes(&seed.into()).is_err() {
            seed = Sha256::digest(seed).into();
        }
    }
    seed
}

struct RoundState {
    started: bool,
    share_sent: bool,
    /// sender -> round payload; kept so equivocation is detectable
    commits: BTreeMap<String, Vec<u8>>,
    shares: BTreeMap<String, Vec<u8>>,
}

impl RoundState {
    fn new() -> Self {
        Self {
            started: false,
            share_sent: false,
            commits: BTreeMap::new(),
            shares: BTreeMap::new(),
        }
    }
}

/// Record one round message. Resending the same bytes is a benign
/// duplicate; two different payloads for one round from the same sender is
/// equivocation, and the run aborts naming that sender as the culprit.
fn record_round_message(
    round: &str,
    entries: &mut BTreeMap<String, Vec<u8>>,
    from: &PartyId,
    payload: &[u8],
) -> PartyResult<()> {
    match entries.get(&from.id) {
        Some(existing) if existing.as_slice() == payload => {
            Err(PartyError::Duplicate(from.id.clone()))
        }
        Some(_) => Err(PartyError::Failed {
            reason: format!("conflicting {} message from {}", round, from.id),
            culprits: vec![from.id.clone()],
        }),
        None => {
            entries.insert(from.id.clone(), payload.to_vec());
            Ok(())
        }
    }
}

/// Shared round machinery for the keygen and signing parties
struct Rounds {
    this_id: String,
    party_ids: Vec<String>,
    out: mpsc::Sender<PartyMessage>,
    state: Mutex<RoundState>,
}

impl Rounds {
    fn new(this_id: String, party_ids: Vec<String>, out: mpsc::Sender<PartyMessage>) -> Self {
        Self {
            this_id,
            party_ids,
            out,
            state: Mutex::new(RoundState::new()),
        }
    }

    fn peers(&self) -> usize {
        self.party_ids.len().saturating_sub(1)
    }

    fn broadcast(&self, prefix: &str) -> PartyResult<()> {
        let payload = format!("{}:{}", prefix, self.this_id).into_bytes();
        self.out
            .try_send(PartyMessage {
                payload,
                to: Vec::new(),
            })
            .map_err(|_| PartyError::ChannelClosed)
    }

    /// Apply one inbound message; returns true when both rounds are full
    fn apply(&self, payload: &[u8], from: &PartyId) -> PartyResult<bool> {
        if !self.party_ids.contains(&from.id) {
            return Err(PartyError::Rejected(format!("unknown party {}", from.id)));
        }
        if from.id == self.this_id {
            return Err(PartyError::Rejected("message from self".to_string()));
        }

        let text = std::str::from_utf8(payload)
            .map_err(|_| PartyError::Rejected("non-utf8 round payload".to_string()))?;

        let mut state = self.state.lock().unwrap();
        if text.starts_with(COMMIT_PREFIX) {
            record_round_message("commit", &mut state.commits, from, payload)?;
        } else if text.starts_with(SHARE_PREFIX) {
            record_round_message("share", &mut state.shares, from, payload)?;
        } else {
            return Err(PartyError::Rejected(format!(
                "unrecognized round payload: {:.16}",
                text
            )));
        }

        self.advance(&mut state)
    }

    fn start(&self) -> PartyResult<bool> {
        self.broadcast(COMMIT_PREFIX)?;
        let mut state = self.state.lock().unwrap();
        state.started = true;
        self.advance(&mut state)
    }

    /// Move through round 2 and report completion
    fn advance(&self, state: &mut RoundState) -> PartyResult<bool> {
        let peers = self.peers();
        if state.started && !state.share_sent && state.commits.len() >= peers {
            self.broadcast(SHARE_PREFIX)?;
            state.share_sent = true;
        }
        Ok(state.share_sent && state.commits.len() >= peers && state.shares.len() >= peers)
    }
}

/// Deterministic keygen party
pub struct LocalKeygenParty {
    params: KeygenParams,
    rounds: Rounds,
    end: Mutex<Option<oneshot::Sender<PartyResult<KeygenOutput>>>>,
}

impl LocalKeygenParty {
    fn finish(&self) -> PartyResult<()> {
        let sender = match self.end.lock().unwrap().take() {
            Some(sender) => sender,
            None => return Ok(()), // already finished
        };
        let result = self.compute_output();
        sender.send(result).map_err(|_| PartyError::ChannelClosed)
    }

    /// Terminate the run with an attributable failure
    fn abort(&self, reason: &str, culprits: &[String]) {
        if let Some(sender) = self.end.lock().unwrap().take() {
            let _ = sender.send(Err(PartyError::Failed {
                reason: reason.to_string(),
                culprits: culprits.to_vec(),
            }));
        }
    }

    fn compute_output(&self) -> PartyResult<KeygenOutput> {
        let secret = derive_group_secret(
            self.params.curve,
            &self.params.key_id,
            &self.params.parties,
        );

        let share_index = self
            .params
            .parties
            .iter()
            .position(|p| p.id == self.params.this_party.id)
            .ok_or_else(|| PartyError::Failed {
                reason: "this party is not in the participant set".to_string(),
                culprits: Vec::new(),
            })? as u32
            + 1;

        let public_key = match self.params.curve {
            Curve::Secp256k1 => {
                let signing_key = k256::ecdsa::SigningKey::from_bytes(&secret.into())
                    .map_err(|e| PartyError::Failed {
                        reason: format!("invalid group scalar: {}", e),
                        culprits: Vec::new(),
                    })?;
                let point = signing_key.verifying_key().to_encoded_point(false);
                let x: [u8; 32] = point
                    .x()
                    .and_then(|x| x.as_slice().try_into().ok())
                    .ok_or_else(|| PartyError::Failed {
                        reason: "group key has no affine X".to_string(),
                        culprits: Vec::new(),
                    })?;
                let y: [u8; 32] = point
                    .y()
                    .and_then(|y| y.as_slice().try_into().ok())
                    .ok_or_else(|| PartyError::Failed {
                        reason: "group key has no affine Y".to_string(),
                        culprits: Vec::new(),
                    })?;
                PublicKeyPoint::Secp256k1 { x, y }
            }
            Curve::Ed25519 => {
                let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
                let canonical = signing_key.verifying_key().to_bytes();
                let x_is_odd = canonical[31] & 0x80 != 0;
                let mut y_le = canonical;
                y_le[31] &= 0x7f;
                let mut y = y_le;
                y.reverse();
                PublicKeyPoint::Ed25519 { y, x_is_odd }
            }
        };

        Ok(KeygenOutput {
            public_key,
            secret_share: secret.to_vec(),
            share_index,
        })
    }
}

impl Party for LocalKeygenParty {
    fn start(&self) -> PartyResult<()> {
        if self.rounds.start()? {
            self.finish()?;
        }
        Ok(())
    }

    fn update_from_bytes(
        &self,
        payload: &[u8],
        from: &PartyId,
        _is_broadcast: bool,
    ) -> PartyResult<()> {
        match self.rounds.apply(payload, from) {
            Ok(true) => self.finish(),
            Ok(false) => Ok(()),
            Err(PartyError::Failed { reason, culprits }) => {
                // attributable misbehavior ends the whole run, not just
                // this message
                self.abort(&reason, &culprits);
                Err(PartyError::Failed { reason, culprits })
            }
            Err(other) => Err(other),
        }
    }
}

/// Deterministic signing party
pub struct LocalSigningParty {
    params: SigningParams,
    rounds: Rounds,
    end: Mutex<Option<oneshot::Sender<PartyResult<SigningOutput>>>>,
}

impl LocalSigningParty {
    fn finish(&self) -> PartyResult<()> {
        let sender = match self.end.lock().unwrap().take() {
            Some(sender) => sender,
            None => return Ok(()),
        };
        let result = self.compute_signature();
        sender.send(result).map_err(|_| PartyError::ChannelClosed)
    }

    /// Terminate the run with an attributable failure
    fn abort(&self, reason: &str, culprits: &[String]) {
        if let Some(sender) = self.end.lock().unwrap().take() {
            let _ = sender.send(Err(PartyError::Failed {
                reason: reason.to_string(),
                culprits: culprits.to_vec(),
            }));
        }
    }

    fn compute_signature(&self) -> PartyResult<SigningOutput> {
        let secret: [u8; 32] =
            self.params
                .secret_share
                .as_slice()
                .try_into()
                .map_err(|_| PartyError::Failed {
                    reason: "secret share must be 32 bytes".to_string(),
                    culprits: Vec::new(),
                })?;

        match self.params.curve {
            Curve::Secp256k1 => {
                let signing_key = k256::ecdsa::SigningKey::from_bytes(&secret.into())
                    .map_err(|e| PartyError::Failed {
                        reason: format!("invalid share scalar: {}", e),
                        culprits: Vec::new(),
                    })?;
                // deterministic RFC 6979 nonce: every signer emits the same (r, s)
                let signature: k256::ecdsa::Signature = signing_key.sign(&self.params.message);
                let (r, s) = signature.split_bytes();
                Ok(SigningOutput {
                    r: r.into(),
                    s: s.into(),
                })
            }
            Curve::Ed25519 => {
                let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
                let signature =
                    ed25519_dalek::Signer::sign(&signing_key, &self.params.message).to_bytes();
                let mut r = [0u8; 32];
                let mut s = [0u8; 32];
                r.copy_from_slice(&signature[..32]);
                s.copy_from_slice(&signature[32..]);
                Ok(SigningOutput { r, s })
            }
        }
    }
}

impl Party for LocalSigningParty {
    fn start(&self) -> PartyResult<()> {
        if self.rounds.start()? {
            self.finish()?;
        }
        Ok(())
    }

    fn update_from_bytes(
        &self,
        payload: &[u8],
        from: &PartyId,
        _is_broadcast: bool,
    ) -> PartyResult<()> {
        match self.rounds.apply(payload, from) {
            Ok(true) => self.finish(),
            Ok(false) => Ok(()),
            Err(PartyError::Failed { reason, culprits }) => {
                self.abort(&reason, &culprits);
                Err(PartyError::Failed { reason, culprits })
            }
            Err(other) => Err(other),
        }
    }
}

/// Factory for the deterministic parties; counts constructions so tests can
/// assert at-most-once startup.
pub struct LocalPartyFactory {
    keygen_built: AtomicUsize,
    signing_built: AtomicUsize,
}

impl LocalPartyFactory {
    pub fn new() -> Self {
        Self {
            keygen_built: AtomicUsize::new(0),
            signing_built: AtomicUsize::new(0),
        }
    }

    /// Number of keygen parties constructed since creation
    pub fn keygen_parties_built(&self) -> usize {
        self.keygen_built.load(Ordering::SeqCst)
    }

    /// Number of signing parties constructed since creation
    pub fn signing_parties_built(&self) -> usize {
        self.signing_built.load(Ordering::SeqCst)
    }
}

impl Default for LocalPartyFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PartyFactory for LocalPartyFactory {
    fn new_keygen_party(
        &self,
        params: KeygenParams,
        out: mpsc::Sender<PartyMessage>,
        end: oneshot::Sender<PartyResult<KeygenOutput>>,
    ) -> PartyResult<Arc<dyn Party>> {
        self.keygen_built.fetch_add(1, Ordering::SeqCst);
        let party_ids = params.parties.iter().map(|p| p.id.clone()).collect();
        let this_id = params.this_party.id.clone();
        Ok(Arc::new(LocalKeygenParty {
            rounds: Rounds::new(this_id, party_ids, out),
            params,
            end: Mutex::new(Some(end)),
        }))
    }

    fn new_signing_party(
        &self,
        params: SigningParams,
        out: mpsc::Sender<PartyMessage>,
        end: oneshot::Sender<PartyResult<SigningOutput>>,
    ) -> PartyResult<Arc<dyn Party>> {
        self.signing_built.fetch_add(1, Ordering::SeqCst);
        let party_ids = params.parties.iter().map(|p| p.id.clone()).collect();
        let this_id = params.this_party.id.clone();
        Ok(Arc::new(LocalSigningParty {
            rounds: Rounds::new(this_id, party_ids, out),
            params,
            end: Mutex::new(Some(end)),
        }))
    }
}
