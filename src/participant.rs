//! Participant Role
//!
//! Every node reacts to inbound protocol envelopes: classify the session as
//! DKG or signing, honor the two in-band control payloads, lazily start the
//! local Party for DKG sessions, and queue the bytes for the pumps.

use std::sync::Arc;

use tracing::{info, warn};

use crate::common::{MpcError, Result};
use crate::party::{KeygenLaunch, PartyManager};
use crate::session::SessionManager;
use crate::types::message::IncomingMessage;
use crate::types::session::SessionKind;

const DKG_START: &[u8] = b"DKG_START";
const DKG_COMPLETE_PREFIX: &[u8] = b"DKG_COMPLETE:";

/// In-band control payloads mixed into the protocol byte stream
///
/// The wire stays byte-compatible with the plain prefixes; everything after
/// this parse works with the typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Startup nudge from the coordinator; carries nothing
    DkgStart,
    /// A peer finished DKG and published the group key
    DkgComplete { public_key_hex: String },
}

/// Parse a control payload, if the bytes are one
pub fn parse_control(payload: &[u8]) -> Option<ControlMessage> {
    if payload == DKG_START {
        return Some(ControlMessage::DkgStart);
    }
    if let Some(rest) = payload.strip_prefix(DKG_COMPLETE_PREFIX) {
        let public_key_hex = String::from_utf8(rest.to_vec()).ok()?;
        return Some(ControlMessage::DkgComplete { public_key_hex });
    }
    None
}

/// Inbound protocol-message handler for this node
pub struct Participant {
    node_id: String,
    sessions: Arc<SessionManager>,
    parties: Arc<PartyManager>,
}

impl Participant {
    pub fn new(
        node_id: impl Into<String>,
        sessions: Arc<SessionManager>,
        parties: Arc<PartyManager>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            sessions,
            parties,
        }
    }

    /// Handle one inbound protocol envelope
    pub async fn handle_protocol_message(
        &self,
        session_id: &str,
        from_node_id: &str,
        payload: Vec<u8>,
        is_broadcast: bool,
    ) -> Result<()> {
        let session = self.sessions.get_session(session_id).await.map_err(|e| {
            MpcError::SessionNotFound(format!(
                "{} (message from {}, this node {}). Possible causes: \
                 1) the session was not created by the coordinator, \
                 2) the session is not yet visible due to replication lag, \
                 3) the session expired or was deleted. ({})",
                session_id, from_node_id, self.node_id, e
            ))
        })?;

        match session.kind() {
            SessionKind::Keygen => {
                if let Some(control) = parse_control(&payload) {
                    return self.handle_control(session_id, control).await;
                }

                // Lazy auto-start: the first inbound message for a session
                // this node participates in starts the local Party. The
                // leader kick and this path converge on the same guard.
                if session.participating_nodes.iter().any(|n| n == &self.node_id)
                    && session.threshold > 0
                    && session.total_nodes > 0
                {
                    let launch = KeygenLaunch {
                        key_id: session.key_id.clone(),
                        protocol: session.protocol.protocol(),
                        threshold: session.threshold,
                        total_nodes: session.total_nodes,
                        node_ids: session.participating_nodes.clone(),
                    };
                    match self.parties.start_keygen(launch).await {
                        Ok(true) => info!(
                            session_id,
                            key_id = %session.key_id,
                            this_node_id = %self.node_id,
                            threshold = session.threshold,
                            total_nodes = session.total_nodes,
                            "Auto-starting DKG on participant (triggered by inbound message)"
                        ),
                        Ok(false) => {} // already running
                        Err(e) => warn!(
                            session_id,
                            error = %e,
                            "Could not auto-start DKG for inbound message"
                        ),
                    }
                }

                self.parties
                    .enqueue_keygen(
                        session_id,
                        IncomingMessage {
                            from_node_id: from_node_id.to_string(),
                            payload,
                            is_broadcast,
                        },
                    )
                    .await
            }
            SessionKind::Signing => {
                self.parties
                    .enqueue_signing(
                        session_id,
                        IncomingMessage {
                            from_node_id: from_node_id.to_string(),
                            payload,
                            is_broadcast,
                        },
                    )
                    .await
            }
        }
    }

    async fn handle_control(&self, session_id: &str, control: ControlMessage) -> Result<()> {
        match control {
            // the coordinator's nudge only announces the session; the real
            // round messages follow and trigger the actual start
            ControlMessage::DkgStart => Ok(()),
            ControlMessage::DkgComplete { public_key_hex } => {
                info!(session_id, public_key = %public_key_hex, "Peer announced DKG completion");
                self.sessions
                    .complete_keygen(session_id, &public_key_hex)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyshare::KeyShareVault;
    use crate::party::local::LocalPartyFactory;
    use crate::party::manager::MessageRouter;
    use crate::protocol::{Protocol, ProtocolRegistry};
    use crate::storage::memory::{MemoryCache, MemoryStore};
    use crate::storage::traits::KeyStore;
    use crate::types::key::{Algorithm, Curve, KeyMetadata};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullRouter;

    #[async_trait]
    impl MessageRouter for NullRouter {
        async fn send_keygen(&self, _: &str, _: &str, _: &[u8], _: bool) -> Result<()> {
            Ok(())
        }
        async fn send_signing(&self, _: &str, _: &str, _: &[u8], _: bool) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_control() {
        assert_eq!(parse_control(b"DKG_START"), Some(ControlMessage::DkgStart));
        assert_eq!(
            parse_control(b"DKG_COMPLETE:02abcd"),
            Some(ControlMessage::DkgComplete {
                public_key_hex: "02abcd".into()
            })
        );
        assert_eq!(parse_control(b"round1 bytes"), None);
        assert_eq!(parse_control(b"DKG_STARTLE"), None);
    }

    async fn build_participant(
        node_id: &str,
    ) -> (Participant, Arc<SessionManager>, Arc<LocalPartyFactory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryCache::new()),
            store.clone(),
            Duration::from_secs(300),
        ));
        store
            .save_key(&KeyMetadata::placeholder(
                "k-1",
                Algorithm::Ecdsa,
                Curve::Secp256k1,
                2,
                3,
            ))
            .await
            .unwrap();
        sessions
            .create_dkg_session(
                "k-1",
                Protocol::Gg18,
                2,
                3,
                vec!["n1".into(), "n2".into(), "n3".into()],
            )
            .await
            .unwrap();

        let factory = Arc::new(LocalPartyFactory::new());
        let parties = PartyManager::new(
            node_id,
            ProtocolRegistry::all(),
            Arc::new(NullRouter),
            factory.clone(),
            Arc::new(KeyShareVault::new(dir.path(), "secret")),
            sessions.clone(),
        );
        (
            Participant::new(node_id, sessions.clone(), parties),
            sessions,
            factory,
            dir,
        )
    }

    #[tokio::test]
    async fn test_unknown_session_error_names_causes() {
        let (participant, _, _, _dir) = build_participant("n2").await;
        let err = participant
            .handle_protocol_message("ghost", "n1", b"data".to_vec(), false)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("1)"));
        assert!(msg.contains("2)"));
        assert!(msg.contains("3)"));
    }

    #[tokio::test]
    async fn test_inbound_message_auto_starts_party() {
        let (participant, _, factory, _dir) = build_participant("n2").await;

        // burst of identical round-1 frames for a brand-new session
        for _ in 0..50 {
            participant
                .handle_protocol_message("k-1", "n1", b"kq-commit:n1".to_vec(), true)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.keygen_parties_built(), 1);
    }

    #[tokio::test]
    async fn test_dkg_start_is_a_noop_trigger() {
        let (participant, _, factory, _dir) = build_participant("n2").await;
        participant
            .handle_protocol_message("k-1", "coordinator", b"DKG_START".to_vec(), false)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        // the nudge alone does not construct a Party
        assert_eq!(factory.keygen_parties_built(), 0);
    }

    #[tokio::test]
    async fn test_dkg_complete_promotes_session() {
        let (participant, sessions, _, _dir) = build_participant("n2").await;
        participant
            .handle_protocol_message("k-1", "n1", b"DKG_COMPLETE:02abcd".to_vec(), false)
            .await
            .unwrap();

        let session = sessions.get_session("k-1").await.unwrap();
        assert_eq!(
            session.status,
            crate::types::session::SessionStatus::Completed
        );
        assert_eq!(session.signature.as_deref(), Some("02abcd"));
    }

    #[tokio::test]
    async fn test_non_participant_only_queues() {
        // n9 is not in the participant list: no Party, message still queued
        let (participant, _, factory, _dir) = build_participant("n9").await;
        participant
            .handle_protocol_message("k-1", "n1", b"kq-commit:n1".to_vec(), true)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.keygen_parties_built(), 0);
    }
}
