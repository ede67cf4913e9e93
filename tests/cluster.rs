//! End-to-End Cluster Scenarios
//!
//! Three participants and a coordinator wired over an in-process loopback
//! transport that delivers through each node's Participant exactly like the
//! HTTP path, sharing one store the way the real cluster shares a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyquorum::common::{MpcError, Result};
use keyquorum::coordinator::{Coordinator, DkgKick};
use keyquorum::discovery::{ServiceInfo, StaticDiscovery};
use keyquorum::keys::KeyService;
use keyquorum::keyshare::KeyShareVault;
use keyquorum::participant::Participant;
use keyquorum::party::convert;
use keyquorum::party::{
    KeygenLaunch, LocalPartyFactory, MessageRouter, PartyManager, SigningLaunch,
};
use keyquorum::protocol::{Protocol, ProtocolRegistry};
use keyquorum::session::SessionManager;
use keyquorum::storage::memory::{MemoryCache, MemoryStore};
use keyquorum::storage::sqlite::SqliteStore;
use keyquorum::transport::types::{
    CreateDkgSessionRequest, CreateSigningSessionRequest, StartDkgRequest, StartDkgResponse,
    TransportError,
};
use keyquorum::types::key::KeyStatus;
use keyquorum::types::session::SessionStatus;
use tokio::sync::RwLock;

#[derive(Default)]
struct Hub {
    participants: RwLock<HashMap<String, Arc<Participant>>>,
    managers: RwLock<HashMap<String, Arc<PartyManager>>>,
    fail_kick: AtomicBool,
}

/// Per-node router delivering through the target's Participant
struct LoopbackRouter {
    self_id: String,
    hub: Arc<Hub>,
}

impl LoopbackRouter {
    async fn deliver(
        &self,
        session_id: &str,
        target: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()> {
        let participant = self
            .hub
            .participants
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| MpcError::RouteFailure {
                target: target.to_string(),
                reason: "unknown peer".to_string(),
            })?;
        participant
            .handle_protocol_message(session_id, &self.self_id, payload.to_vec(), is_broadcast)
            .await
    }
}

#[async_trait]
impl MessageRouter for LoopbackRouter {
    async fn send_keygen(
        &self,
        session_id: &str,
        target: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()> {
        self.deliver(session_id, target, payload, is_broadcast).await
    }

    async fn send_signing(
        &self,
        session_id: &str,
        target: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()> {
        self.deliver(session_id, target, payload, is_broadcast).await
    }
}

/// Loopback StartDKG kick; can be switched to fail for the rescue scenario
struct LoopbackKick {
    hub: Arc<Hub>,
}

#[async_trait]
impl DkgKick for LoopbackKick {
    async fn start_dkg(
        &self,
        target_node_id: &str,
        request: &StartDkgRequest,
    ) -> Result<StartDkgResponse> {
        if self.hub.fail_kick.load(Ordering::SeqCst) {
            return Err(MpcError::Transport(TransportError::Http(
                "connection refused".to_string(),
            )));
        }
        let manager = self
            .hub
            .managers
            .read()
            .await
            .get(target_node_id)
            .cloned()
            .ok_or_else(|| MpcError::Transport(TransportError::PeerUnresolved(
                target_node_id.to_string(),
            )))?;

        let started = manager
            .start_keygen(KeygenLaunch {
                key_id: request.key_id.clone(),
                protocol: request.protocol.unwrap_or(Protocol::Gg18),
                threshold: request.threshold,
                total_nodes: request.total_nodes,
                node_ids: request.node_ids.clone(),
            })
            .await?;
        Ok(StartDkgResponse {
            started,
            message: "DKG scheduled".to_string(),
        })
    }
}

struct TestNode {
    parties: Arc<PartyManager>,
    participant: Arc<Participant>,
    factory: Arc<LocalPartyFactory>,
    vault: Arc<KeyShareVault>,
}

struct Cluster {
    store: MemoryStore,
    hub: Arc<Hub>,
    sessions: Arc<SessionManager>,
    nodes: HashMap<String, TestNode>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    async fn new(node_ids: &[&str]) -> Self {
        let store = MemoryStore::new();
        let hub = Arc::new(Hub::default());
        let mut nodes = HashMap::new();
        let mut dirs = Vec::new();

        for node_id in node_ids {
            let dir = tempfile::tempdir().unwrap();
            let sessions = shared_sessions(&store);
            let factory = Arc::new(LocalPartyFactory::new());
            let vault = Arc::new(KeyShareVault::new(dir.path(), "cluster-secret"));
            let router = Arc::new(LoopbackRouter {
                self_id: node_id.to_string(),
                hub: hub.clone(),
            });
            let parties = PartyManager::new(
                *node_id,
                ProtocolRegistry::all(),
                router,
                factory.clone(),
                vault.clone(),
                sessions.clone(),
            );
            let participant = Arc::new(Participant::new(*node_id, sessions, parties.clone()));

            hub.participants
                .write()
                .await
                .insert(node_id.to_string(), participant.clone());
            hub.managers
                .write()
                .await
                .insert(node_id.to_string(), parties.clone());

            nodes.insert(
                node_id.to_string(),
                TestNode {
                    parties,
                    participant,
                    factory,
                    vault,
                },
            );
            dirs.push(dir);
        }

        let sessions = shared_sessions(&store);
        Cluster {
            store,
            hub,
            sessions,
            nodes,
            _dirs: dirs,
        }
    }

    /// Coordinator over the shared store; discovery reports the given
    /// participant ids
    fn coordinator(&self, discovered: &[&str]) -> Coordinator {
        let services: Vec<ServiceInfo> = discovered
            .iter()
            .map(|id| ServiceInfo::for_node(id, "participant", "127.0.0.1", 9000))
            .collect();
        Coordinator::new(
            "coord-1",
            Arc::new(KeyService::new(Arc::new(self.store.clone()))),
            shared_sessions(&self.store),
            Arc::new(StaticDiscovery::new(services)),
            ProtocolRegistry::all(),
            Arc::new(LoopbackKick {
                hub: self.hub.clone(),
            }),
        )
    }

    fn node(&self, node_id: &str) -> &TestNode {
        &self.nodes[node_id]
    }
}

fn shared_sessions(store: &MemoryStore) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(MemoryCache::new()),
        Arc::new(store.clone()),
        Duration::from_secs(300),
    ))
}

fn dkg_request(key_id: &str, protocol: Protocol) -> CreateDkgSessionRequest {
    CreateDkgSessionRequest {
        key_id: key_id.to_string(),
        protocol: Some(protocol),
        algorithm: protocol.algorithm(),
        curve: protocol.curve(),
        threshold: 2,
        total_nodes: 3,
        node_ids: Vec::new(),
    }
}

/// Poll until the condition holds or the deadline passes
async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_dkg(cluster: &Cluster, key_id: &str, node_ids: &[&str]) {
    let sessions = cluster.sessions.clone();
    let key_id_owned = key_id.to_string();
    wait_for("DKG session completion", || {
        let sessions = sessions.clone();
        let key_id = key_id_owned.clone();
        async move {
            matches!(
                sessions.get_session(&key_id).await,
                Ok(session) if session.status == SessionStatus::Completed
            )
        }
    })
    .await;

    // every participant persisted its encrypted share
    for node_id in node_ids {
        let vault = cluster.node(node_id).vault.clone();
        let key_id_owned = key_id.to_string();
        let node_id_owned = node_id.to_string();
        wait_for("key share persistence", move || {
            let vault = vault.clone();
            let key_id = key_id_owned.clone();
            let node_id = node_id_owned.clone();
            async move { vault.exists(&key_id, &node_id) }
        })
        .await;
    }
}

// S1: happy-path DKG over GG18/secp256k1
#[tokio::test]
async fn happy_path_dkg_completes_and_activates_key() {
    let cluster = Cluster::new(&["n1", "n2", "n3"]).await;
    let coordinator = cluster.coordinator(&["n1", "n2", "n3"]);

    let session = coordinator
        .create_dkg_session(&dkg_request("k-1", Protocol::Gg18))
        .await
        .unwrap();
    assert_eq!(session.session_id, "k-1");
    assert_eq!(session.leader(), Some("n1"));

    wait_for_dkg(&cluster, "k-1", &["n1", "n2", "n3"]).await;

    // the session carries the public key and the key row is Active
    let completed = cluster.sessions.get_session("k-1").await.unwrap();
    let public_key_hex = completed.signature.clone().unwrap();

    let keys = KeyService::new(Arc::new(cluster.store.clone()));
    let key = keys.get_key("k-1").await.unwrap();
    assert_eq!(key.status, KeyStatus::Active);
    assert_eq!(key.public_key, public_key_hex);

    // all three nodes derived the identical public key, and it parses as a
    // compressed secp256k1 point
    for node_id in ["n1", "n2", "n3"] {
        assert_eq!(
            cluster.node(node_id).vault.public_key("k-1", node_id).unwrap(),
            public_key_hex
        );
    }
    let bytes = hex::decode(&public_key_hex).unwrap();
    assert_eq!(bytes.len(), 33);
    assert!(k256::ecdsa::VerifyingKey::from_sec1_bytes(&bytes).is_ok());

    // exactly one Party per node, regardless of message interleaving
    for node_id in ["n1", "n2", "n3"] {
        assert_eq!(cluster.node(node_id).factory.keygen_parties_built(), 1);
    }
}

// S2: happy-path signing after S1
#[tokio::test]
async fn signing_produces_verifiable_der_signature() {
    let cluster = Cluster::new(&["n1", "n2", "n3"]).await;
    let coordinator = cluster.coordinator(&["n1", "n2", "n3"]);
    coordinator
        .create_dkg_session(&dkg_request("k-1", Protocol::Gg18))
        .await
        .unwrap();
    wait_for_dkg(&cluster, "k-1", &["n1", "n2", "n3"]).await;

    let signing = coordinator
        .create_signing_session(&CreateSigningSessionRequest {
            key_id: "k-1".to_string(),
            protocol: Some(Protocol::Gg18),
        })
        .await
        .unwrap();

    let message = vec![0xDE, 0xAD, 0xBE, 0xEF];
    let launch = |session_id: String| SigningLaunch {
        session_id,
        key_id: "k-1".to_string(),
        protocol: Protocol::Gg18,
        message: message.clone(),
        node_ids: vec!["n1".to_string(), "n2".to_string()],
    };

    let first = {
        let parties = cluster.node("n1").parties.clone();
        let launch = launch(signing.session_id.clone());
        tokio::spawn(async move { parties.execute_signing(launch).await })
    };
    let second = {
        let parties = cluster.node("n2").parties.clone();
        let launch = launch(signing.session_id.clone());
        tokio::spawn(async move { parties.execute_signing(launch).await })
    };

    let sig1 = first.await.unwrap().unwrap();
    let sig2 = second.await.unwrap().unwrap();
    assert_eq!(sig1.hex, sig2.hex);

    // the DER signature verifies against the DKG public key
    let key = KeyService::new(Arc::new(cluster.store.clone()))
        .get_key("k-1")
        .await
        .unwrap();
    let public_key = hex::decode(&key.public_key).unwrap();
    assert!(convert::verify_ecdsa(&sig1.bytes, &message, &public_key).unwrap());

    // completing the session is terminal
    cluster
        .sessions
        .complete_signing(&signing.session_id, &sig1.hex)
        .await
        .unwrap();
    let completed = cluster.sessions.get_session(&signing.session_id).await.unwrap();
    assert_eq!(completed.status, SessionStatus::Completed);
    assert!(cluster
        .sessions
        .complete_signing(&signing.session_id, "ffff")
        .await
        .is_err());
}

// FROST runs the same machinery on Ed25519
#[tokio::test]
async fn frost_dkg_and_signing_on_ed25519() {
    let cluster = Cluster::new(&["n1", "n2", "n3"]).await;
    let coordinator = cluster.coordinator(&["n1", "n2", "n3"]);

    coordinator
        .create_dkg_session(&dkg_request("k-frost", Protocol::Frost))
        .await
        .unwrap();
    wait_for_dkg(&cluster, "k-frost", &["n1", "n2", "n3"]).await;

    let key = KeyService::new(Arc::new(cluster.store.clone()))
        .get_key("k-frost")
        .await
        .unwrap();
    let public_key = hex::decode(&key.public_key).unwrap();
    // 32-byte packed Ed25519 point, valid under the dalek parser
    assert_eq!(public_key.len(), 32);
    assert!(ed25519_dalek::VerifyingKey::from_bytes(
        public_key.as_slice().try_into().unwrap()
    )
    .is_ok());

    let signing = coordinator
        .create_signing_session(&CreateSigningSessionRequest {
            key_id: "k-frost".to_string(),
            protocol: Some(Protocol::Frost),
        })
        .await
        .unwrap();

    let message = b"frost message".to_vec();
    let mut handles = Vec::new();
    for node_id in ["n1", "n2"] {
        let parties = cluster.node(node_id).parties.clone();
        let launch = SigningLaunch {
            session_id: signing.session_id.clone(),
            key_id: "k-frost".to_string(),
            protocol: Protocol::Frost,
            message: message.clone(),
            node_ids: vec!["n1".to_string(), "n2".to_string()],
        };
        handles.push(tokio::spawn(async move {
            parties.execute_signing(launch).await
        }));
    }

    let sig = handles.remove(0).await.unwrap().unwrap();
    let _ = handles.remove(0).await.unwrap().unwrap();
    // 64-byte r||s form verifying under the dalek verifier
    assert_eq!(sig.bytes.len(), 64);
    assert!(convert::verify_ed25519(&sig.bytes, &message, &public_key).unwrap());
}

// S3: insufficient participants
#[tokio::test]
async fn insufficient_participants_creates_nothing() {
    let cluster = Cluster::new(&["n1", "n2", "n3"]).await;
    let coordinator = cluster.coordinator(&["n1", "n2"]);

    let err = coordinator
        .create_dkg_session(&dkg_request("k-1", Protocol::Gg18))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MpcError::InsufficientNodes {
            required: 3,
            available: 2
        }
    ));

    let keys = KeyService::new(Arc::new(cluster.store.clone()));
    assert!(keys.get_key("k-1").await.is_err());
    assert!(cluster.sessions.get_session("k-1").await.is_err());
}

// S4: foreign-key guard against the real SQLite constraint
#[tokio::test]
async fn foreign_key_guard_over_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sessions = SessionManager::new(
        store.clone(),
        store.clone(),
        Arc::new(MemoryCache::new()),
        store.clone(),
        Duration::from_secs(300),
    );

    let err = sessions
        .create_dkg_session(
            "absent",
            Protocol::Gg18,
            2,
            3,
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
        )
        .await
        .unwrap_err();

    match err {
        MpcError::ForeignKeyViolation(message) => {
            assert!(message.contains("1)"));
            assert!(message.contains("2)"));
            assert!(message.contains("3)"));
        }
        other => panic!("expected ForeignKeyViolation, got {:?}", other),
    }

    assert!(matches!(
        sessions.get_session("absent").await,
        Err(MpcError::SessionNotFound(_))
    ));
}

// S5 / P2: a burst of identical inbound messages builds exactly one Party
#[tokio::test]
async fn duplicate_burst_builds_one_party() {
    let cluster = Cluster::new(&["n1", "n2", "n3"]).await;
    let coordinator = cluster.coordinator(&["n1", "n2", "n3"]);
    // break the kick so nothing starts before the burst
    cluster.hub.fail_kick.store(true, Ordering::SeqCst);
    coordinator
        .create_dkg_session(&dkg_request("k-1", Protocol::Gg18))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // 100 concurrent deliveries of the same round-1 frame to n2
    let mut handles = Vec::new();
    for _ in 0..100 {
        let participant = cluster.node("n2").participant.clone();
        handles.push(tokio::spawn(async move {
            participant
                .handle_protocol_message("k-1", "n1", b"kq-commit:n1".to_vec(), true)
                .await
        }));
    }
    for handle in handles {
        // every enqueue lands or reports a recoverable queue-full
        match handle.await.unwrap() {
            Ok(()) => {}
            Err(e) => assert!(e.is_recoverable(), "unexpected error: {}", e),
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.node("n2").factory.keygen_parties_built(), 1);
}

// S6: leader kick fails, a routed round-1 message rescues the session
#[tokio::test]
async fn dkg_survives_missed_leader_kick() {
    let cluster = Cluster::new(&["n1", "n2", "n3"]).await;
    let coordinator = cluster.coordinator(&["n1", "n2", "n3"]);

    cluster.hub.fail_kick.store(true, Ordering::SeqCst);
    let session = coordinator
        .create_dkg_session(&dkg_request("k-1", Protocol::Gg18))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the kick failed: session still Pending, nothing started anywhere
    let pending = cluster.sessions.get_session("k-1").await.unwrap();
    assert_eq!(pending.status, SessionStatus::Pending);
    for node_id in ["n1", "n2", "n3"] {
        assert_eq!(cluster.node(node_id).factory.keygen_parties_built(), 0);
    }

    // n1 starts independently (as if the kick had reached it after all);
    // its round-1 broadcast pulls the other participants in
    cluster
        .node("n1")
        .parties
        .start_keygen(KeygenLaunch {
            key_id: "k-1".to_string(),
            protocol: Protocol::Gg18,
            threshold: session.threshold,
            total_nodes: session.total_nodes,
            node_ids: session.participating_nodes.clone(),
        })
        .await
        .unwrap();

    wait_for_dkg(&cluster, "k-1", &["n1", "n2", "n3"]).await;

    let keys = KeyService::new(Arc::new(cluster.store.clone()));
    let key = keys.get_key("k-1").await.unwrap();
    assert_eq!(key.status, KeyStatus::Active);
    assert_ne!(key.public_key, "pending");
}

// P7: the elected leader is identical on every node's view of the session
#[tokio::test]
async fn leader_election_is_stable() {
    let cluster = Cluster::new(&["n1", "n2", "n3"]).await;
    let coordinator = cluster.coordinator(&["n3", "n2", "n1"]);
    coordinator
        .create_dkg_session(&dkg_request("k-1", Protocol::Gg18))
        .await
        .unwrap();

    // every node reads the same sorted participant list and the same leader
    let mut leaders = Vec::new();
    for _ in 0..3 {
        let session = cluster.sessions.get_session("k-1").await.unwrap();
        leaders.push(session.leader().unwrap().to_string());
        assert_eq!(
            session.participating_nodes,
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()]
        );
    }
    assert!(leaders.iter().all(|l| l == "n1"));
}
