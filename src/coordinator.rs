//! Coordinator Role
//!
//! Handles a user request to create a threshold key: picks the participant
//! set, writes the Pending key placeholder and the DKG session, elects the
//! leader and fires the StartDKG kick at it on a detached task. The
//! coordinator itself never holds a key share.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use crate::common::{MpcError, Result};
use crate::discovery::{Discovery, ServiceInfo, MPC_SERVICE_NAME};
use crate::keys::KeyService;
use crate::protocol::ProtocolRegistry;
use crate::session::SessionManager;
use crate::transport::types::{
    CreateDkgSessionRequest, CreateSigningSessionRequest, StartDkgRequest, StartDkgResponse,
};
use crate::types::session::Session;

/// Independent deadline for the detached StartDKG call
const START_DKG_TIMEOUT: Duration = Duration::from_secs(300);

/// The one RPC the coordinator fires at participants
#[async_trait]
pub trait DkgKick: Send + Sync {
    async fn start_dkg(
        &self,
        target_node_id: &str,
        request: &StartDkgRequest,
    ) -> Result<StartDkgResponse>;
}

/// Create-key / create-signing-session orchestration
pub struct Coordinator {
    node_id: String,
    keys: Arc<KeyService>,
    sessions: Arc<SessionManager>,
    discovery: Arc<dyn Discovery>,
    registry: ProtocolRegistry,
    kick: Arc<dyn DkgKick>,
}

impl Coordinator {
    pub fn new(
        node_id: impl Into<String>,
        keys: Arc<KeyService>,
        sessions: Arc<SessionManager>,
        discovery: Arc<dyn Discovery>,
        registry: ProtocolRegistry,
        kick: Arc<dyn DkgKick>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            keys,
            sessions,
            discovery,
            registry,
            kick,
        }
    }

    /// Create a DKG session and kick the leader
    ///
    /// Returns as soon as the session is persisted; the StartDKG RPC runs on
    /// a detached task with its own deadline. A failed kick is not fatal:
    /// participants auto-start from routed round-1 traffic.
    pub async fn create_dkg_session(&self, req: &CreateDkgSessionRequest) -> Result<Session> {
        let protocol = match req.protocol {
            Some(p) => p,
            None => self.registry.default_protocol(),
        };
        self.registry
            .ensure_supported(protocol)
            .map_err(|e| MpcError::invalid(e.to_string()))?;

        // 1. resolve participants; the coordinator never takes part itself
        let mut node_ids = if req.node_ids.is_empty() {
            self.discover_participants(req.total_nodes).await?
        } else {
            req.node_ids.clone()
        };
        node_ids.sort();

        info!(
            key_id = %req.key_id,
            participant_node_ids = ?node_ids,
            coordinator_node_id = %self.node_id,
            threshold = req.threshold,
            total_nodes = req.total_nodes,
            "Participant set resolved for DKG session"
        );

        // 2. the Pending key placeholder must exist before the session row
        self.keys
            .ensure_placeholder(
                &req.key_id,
                req.algorithm,
                req.curve,
                req.threshold,
                req.total_nodes,
            )
            .await?;

        // 3. persist the session with keyId as sessionId
        let session = self
            .sessions
            .create_dkg_session(
                &req.key_id,
                protocol,
                req.threshold,
                req.total_nodes,
                node_ids.clone(),
            )
            .await?;

        // 4. elect the leader and kick it without blocking the request
        self.notify_leader(req, protocol, &node_ids);

        Ok(session)
    }

    async fn discover_participants(&self, required: usize) -> Result<Vec<String>> {
        let services = self
            .discovery
            .discover(
                MPC_SERVICE_NAME,
                &[ServiceInfo::node_type_tag("participant")],
            )
            .await
            .map_err(|e| MpcError::internal(format!("participant discovery failed: {}", e)))?;

        info!(
            discovered = services.len(),
            required,
            "Discovered active participants"
        );

        if services.len() < required {
            return Err(MpcError::InsufficientNodes {
                required,
                available: services.len(),
            });
        }

        let mut node_ids: Vec<String> = services.into_iter().map(|s| s.id).collect();
        node_ids.sort();
        node_ids.truncate(required);
        Ok(node_ids)
    }

    /// Fire StartDKG at the first participant in sorted order
    fn notify_leader(&self, req: &CreateDkgSessionRequest, protocol: crate::protocol::Protocol, node_ids: &[String]) {
        let leader = match node_ids.first() {
            Some(leader) => leader.clone(),
            None => return,
        };

        let start_req = StartDkgRequest {
            key_id: req.key_id.clone(),
            algorithm: req.algorithm,
            curve: req.curve,
            threshold: req.threshold,
            total_nodes: req.total_nodes,
            node_ids: node_ids.to_vec(),
            protocol: Some(protocol),
        };

        info!(
            key_id = %start_req.key_id,
            leader_node_id = %leader,
            all_participants = ?node_ids,
            "Notifying leader participant to start DKG"
        );

        // Detached task with its own deadline so an HTTP-request cancel
        // cannot abort an in-progress DKG. A failed kick is logged only;
        // participants auto-start when round-1 messages reach them.
        let kick = self.kick.clone();
        tokio::spawn(async move {
            let result =
                tokio::time::timeout(START_DKG_TIMEOUT, kick.start_dkg(&leader, &start_req)).await;
            match result {
                Ok(Ok(response)) => info!(
                    key_id = %start_req.key_id,
                    leader_node_id = %leader,
                    started = response.started,
                    message = %response.message,
                    "StartDKG RPC succeeded"
                ),
                Ok(Err(e)) => error!(
                    key_id = %start_req.key_id,
                    leader_node_id = %leader,
                    error = %e,
                    "StartDKG RPC failed; participants will auto-start via message routing"
                ),
                Err(_) => error!(
                    key_id = %start_req.key_id,
                    leader_node_id = %leader,
                    timeout_secs = START_DKG_TIMEOUT.as_secs(),
                    "StartDKG RPC timed out; participants will auto-start via message routing"
                ),
            }
        });
    }

    /// Create a signing session over an Active key
    pub async fn create_signing_session(
        &self,
        req: &CreateSigningSessionRequest,
    ) -> Result<Session> {
        let key = self.keys.get_key(&req.key_id).await?;

        let protocol = match req.protocol {
            Some(p) => p,
            None => self.registry.default_protocol(),
        };
        self.registry
            .ensure_supported(protocol)
            .map_err(|e| MpcError::invalid(e.to_string()))?;

        self.sessions
            .create_signing_session(&req.key_id, protocol, key.threshold, key.total_nodes)
            .await
    }

    /// Cancel a session before any round has begun. In-flight Parties
    /// discover the terminal status at their next completion attempt; no
    /// cross-node cancel is sent.
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        self.sessions.cancel_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::protocol::Protocol;
    use crate::storage::memory::{MemoryCache, MemoryStore};
    use crate::types::key::{Algorithm, Curve, KeyStatus};
    use crate::types::session::SessionStatus;
    use std::sync::Mutex;

    /// Records kicks; optionally fails them
    struct RecordingKick {
        kicked: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingKick {
        fn new(fail: bool) -> Self {
            Self {
                kicked: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl DkgKick for RecordingKick {
        async fn start_dkg(
            &self,
            target_node_id: &str,
            _request: &StartDkgRequest,
        ) -> Result<StartDkgResponse> {
            self.kicked.lock().unwrap().push(target_node_id.to_string());
            if self.fail {
                return Err(MpcError::Transport(
                    crate::transport::types::TransportError::Http("connection refused".into()),
                ));
            }
            Ok(StartDkgResponse {
                started: true,
                message: "DKG scheduled".into(),
            })
        }
    }

    fn cluster_services(ids: &[&str]) -> Vec<ServiceInfo> {
        ids.iter()
            .map(|id| ServiceInfo::for_node(id, "participant", "127.0.0.1", 9000))
            .collect()
    }

    struct Fixture {
        coordinator: Coordinator,
        sessions: Arc<SessionManager>,
        keys: Arc<KeyService>,
        kick: Arc<RecordingKick>,
    }

    fn fixture(participants: &[&str], fail_kick: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryCache::new()),
            store.clone(),
            Duration::from_secs(300),
        ));
        let keys = Arc::new(KeyService::new(store));
        let kick = Arc::new(RecordingKick::new(fail_kick));
        let coordinator = Coordinator::new(
            "coord-1",
            keys.clone(),
            sessions.clone(),
            Arc::new(StaticDiscovery::new(cluster_services(participants))),
            ProtocolRegistry::all(),
            kick.clone(),
        );
        Fixture {
            coordinator,
            sessions,
            keys,
            kick,
        }
    }

    fn dkg_request() -> CreateDkgSessionRequest {
        CreateDkgSessionRequest {
            key_id: "k-1".into(),
            protocol: Some(Protocol::Gg18),
            algorithm: Algorithm::Ecdsa,
            curve: Curve::Secp256k1,
            threshold: 2,
            total_nodes: 3,
            node_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_dkg_session_happy_path() {
        let f = fixture(&["n3", "n1", "n2"], false);

        let session = f.coordinator.create_dkg_session(&dkg_request()).await.unwrap();
        assert_eq!(session.session_id, "k-1");
        assert_eq!(session.status, SessionStatus::Pending);
        // sorted participant list, leader first
        assert_eq!(
            session.participating_nodes,
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()]
        );
        assert_eq!(session.leader(), Some("n1"));

        // placeholder key exists and is Pending
        let key = f.keys.get_key("k-1").await.unwrap();
        assert_eq!(key.status, KeyStatus::Pending);
        assert_eq!(key.public_key, "pending");

        // the detached kick went to the leader
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*f.kick.kicked.lock().unwrap(), vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn test_insufficient_nodes_creates_nothing() {
        let f = fixture(&["n1", "n2"], false);

        let err = f.coordinator.create_dkg_session(&dkg_request()).await.unwrap_err();
        assert!(matches!(
            err,
            MpcError::InsufficientNodes {
                required: 3,
                available: 2
            }
        ));

        // neither a key nor a session was created
        assert!(f.keys.get_key("k-1").await.is_err());
        assert!(f.sessions.get_session("k-1").await.is_err());
    }

    #[tokio::test]
    async fn test_explicit_node_ids_used_verbatim_and_sorted() {
        let f = fixture(&[], false);
        let mut req = dkg_request();
        req.node_ids = vec!["nb".into(), "na".into(), "nc".into()];

        let session = f.coordinator.create_dkg_session(&req).await.unwrap();
        assert_eq!(
            session.participating_nodes,
            vec!["na".to_string(), "nb".to_string(), "nc".to_string()]
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*f.kick.kicked.lock().unwrap(), vec!["na".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_kick_is_not_fatal() {
        let f = fixture(&["n1", "n2", "n3"], true);

        let session = f.coordinator.create_dkg_session(&dkg_request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the kick failed, but the session stays Pending for the fallback path
        let session = f.sessions.get_session(&session.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn test_signing_session_needs_active_key() {
        let f = fixture(&["n1", "n2", "n3"], false);
        f.coordinator.create_dkg_session(&dkg_request()).await.unwrap();

        let err = f
            .coordinator
            .create_signing_session(&CreateSigningSessionRequest {
                key_id: "k-1".into(),
                protocol: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MpcError::InvalidRequest(_)));

        f.sessions.complete_keygen("k-1", "02aa").await.unwrap();
        let session = f
            .coordinator
            .create_signing_session(&CreateSigningSessionRequest {
                key_id: "k-1".into(),
                protocol: None,
            })
            .await
            .unwrap();
        assert_eq!(session.key_id, "k-1");
        assert_ne!(session.session_id, "k-1");
    }
}
