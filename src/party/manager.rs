//! Party Manager
//!
//! Multiplexes many concurrent protocol sessions over a shared transport on
//! one node. Each active session owns three tasks: the Party driver (select
//! loop with the per-protocol deadline), an inbound pump feeding queued
//! messages into the Party, and the outbound fan-out. Startup is at-most-once
//! per `(sessionId, role)` no matter how the session is triggered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, OnceCell, RwLock};
use tracing::{error, info, warn};

use super::convert::{self, ThresholdSignature};
use super::traits::{
    KeygenOutput, KeygenParams, Party, PartyError, PartyFactory, PartyMessage, SigningParams,
};
use crate::common::{MpcError, Result};
use crate::identity::{sort_node_ids, PartyRoster};
use crate::keyshare::{KeyShareVault, StoredKeyShare};
use crate::protocol::{Protocol, ProtocolOptions, ProtocolRegistry};
use crate::session::SessionManager;
use crate::types::message::IncomingMessage;
use crate::types::session::SessionKind;

/// Bounded inbound queue size per active session
const QUEUE_CAPACITY: usize = 100;

/// Routes protocol bytes to a peer node
///
/// Implemented by the transport client; tests plug in an in-process
/// loopback. The router never retries protocol messages.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn send_keygen(
        &self,
        session_id: &str,
        target_node_id: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()>;

    async fn send_signing(
        &self,
        session_id: &str,
        target_node_id: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()>;
}

/// Parameters to start a DKG run on this node
#[derive(Debug, Clone)]
pub struct KeygenLaunch {
    pub key_id: String,
    pub protocol: Protocol,
    pub threshold: usize,
    pub total_nodes: usize,
    pub node_ids: Vec<String>,
}

/// Parameters to start a signing run on this node
#[derive(Debug, Clone)]
pub struct SigningLaunch {
    pub session_id: String,
    pub key_id: String,
    pub protocol: Protocol,
    pub message: Vec<u8>,
    pub node_ids: Vec<String>,
}

struct InboundQueue {
    tx: mpsc::Sender<IncomingMessage>,
    rx: StdMutex<Option<mpsc::Receiver<IncomingMessage>>>,
}

impl InboundQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: StdMutex::new(Some(rx)),
        }
    }
}

/// Per-node protocol session multiplexer
pub struct PartyManager {
    node_id: String,
    registry: ProtocolRegistry,
    roster: PartyRoster,
    router: Arc<dyn MessageRouter>,
    factory: Arc<dyn PartyFactory>,
    vault: Arc<KeyShareVault>,
    sessions: Arc<SessionManager>,

    active_keygen: RwLock<HashMap<String, Arc<dyn Party>>>,
    active_signing: RwLock<HashMap<String, Arc<dyn Party>>>,
    keygen_queues: RwLock<HashMap<String, InboundQueue>>,
    signing_queues: RwLock<HashMap<String, InboundQueue>>,

    /// Single-shot startup guards per `(role, sessionId)`
    start_guards: StdMutex<HashMap<(SessionKind, String), Arc<OnceCell<()>>>>,
}

impl PartyManager {
    pub fn new(
        node_id: impl Into<String>,
        registry: ProtocolRegistry,
        router: Arc<dyn MessageRouter>,
        factory: Arc<dyn PartyFactory>,
        vault: Arc<KeyShareVault>,
        sessions: Arc<SessionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            registry,
            roster: PartyRoster::new(),
            router,
            factory,
            vault,
            sessions,
            active_keygen: RwLock::new(HashMap::new()),
            active_signing: RwLock::new(HashMap::new()),
            keygen_queues: RwLock::new(HashMap::new()),
            signing_queues: RwLock::new(HashMap::new()),
            start_guards: StdMutex::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn guard(&self, role: SessionKind, session_id: &str) -> Arc<OnceCell<()>> {
        let mut guards = self.start_guards.lock().unwrap();
        guards
            .entry((role, session_id.to_string()))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Whether a keygen Party is currently active for the session
    pub async fn has_active_keygen(&self, session_id: &str) -> bool {
        self.active_keygen.read().await.contains_key(session_id)
    }

    /// Whether this node already claimed the startup guard for a session
    pub fn keygen_started(&self, session_id: &str) -> bool {
        self.guard(SessionKind::Keygen, session_id).get().is_some()
    }

    // -------------------------------------------------------------------
    // Inbound queue discipline
    // -------------------------------------------------------------------

    /// Queue an inbound DKG message. Non-blocking: a full queue surfaces as
    /// a recoverable `QueueFull` error to the sender.
    pub async fn enqueue_keygen(&self, session_id: &str, msg: IncomingMessage) -> Result<()> {
        Self::enqueue(&self.keygen_queues, session_id, msg).await
    }

    /// Queue an inbound signing message
    pub async fn enqueue_signing(&self, session_id: &str, msg: IncomingMessage) -> Result<()> {
        Self::enqueue(&self.signing_queues, session_id, msg).await
    }

    async fn enqueue(
        queues: &RwLock<HashMap<String, InboundQueue>>,
        session_id: &str,
        msg: IncomingMessage,
    ) -> Result<()> {
        let tx = {
            let mut map = queues.write().await;
            map.entry(session_id.to_string())
                .or_insert_with(InboundQueue::new)
                .tx
                .clone()
        };

        tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MpcError::QueueFull(session_id.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                MpcError::internal(format!("inbound queue closed for session {}", session_id))
            }
        })
    }

    async fn take_queue_rx(
        queues: &RwLock<HashMap<String, InboundQueue>>,
        session_id: &str,
    ) -> Result<mpsc::Receiver<IncomingMessage>> {
        let mut map = queues.write().await;
        let queue = map
            .entry(session_id.to_string())
            .or_insert_with(InboundQueue::new);
        let result = queue
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| MpcError::internal(format!("inbound pump already running for {}", session_id)));
        result
    }

    // -------------------------------------------------------------------
    // Keygen
    // -------------------------------------------------------------------

    /// Start DKG for a session at most once
    ///
    /// Both triggers converge here: the explicit StartDKG RPC and the lazy
    /// first-inbound-message path. The Party driver runs on a detached task
    /// with its own deadline; this returns as soon as startup is scheduled.
    /// Returns false when the session was already started on this node.
    pub async fn start_keygen(self: &Arc<Self>, launch: KeygenLaunch) -> Result<bool> {
        self.registry
            .ensure_supported(launch.protocol)
            .map_err(|e| MpcError::invalid(e.to_string()))?;
        validate_keygen_launch(&launch)?;

        let guard = self.guard(SessionKind::Keygen, &launch.key_id);
        if guard.set(()).is_err() {
            return Ok(false);
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let key_id = launch.key_id.clone();
            match manager.run_keygen(launch).await {
                Ok(output) => manager.publish_keygen(&key_id, output).await,
                Err(e) => {
                    error!(
                        session_id = %key_id,
                        this_node_id = %manager.node_id,
                        error = %e,
                        "DKG protocol failed"
                    );
                }
            }
        });

        Ok(true)
    }

    /// Drive one DKG run to its terminal state
    async fn run_keygen(self: &Arc<Self>, launch: KeygenLaunch) -> Result<KeygenOutput> {
        let options = self.registry.options(launch.protocol);
        let key_id = launch.key_id.clone();

        let sorted = sort_node_ids(&launch.node_ids);
        if !sorted.iter().any(|n| n == &self.node_id) {
            return Err(MpcError::invalid(format!(
                "node {} is not in the participant set for key {}",
                self.node_id, key_id
            )));
        }

        self.roster.register(&sorted).await;
        let parties = self
            .roster
            .sorted_party_ids(&sorted)
            .await
            .map_err(MpcError::internal)?;
        let this_party = self
            .roster
            .party_id(&self.node_id)
            .await
            .ok_or_else(|| MpcError::internal("this node has no party id"))?;

        info!(
            key_id = %key_id,
            this_node_id = %self.node_id,
            node_ids_sorted = ?sorted,
            party_count = parties.len(),
            threshold = launch.threshold,
            "Starting keygen with sorted node list"
        );

        let (out_tx, out_rx) = mpsc::channel(parties.len());
        let (end_tx, end_rx) = oneshot::channel();
        let params = KeygenParams {
            key_id: key_id.clone(),
            parties,
            this_party,
            threshold: launch.threshold,
            curve: options.protocol.curve(),
        };

        let party = self
            .factory
            .new_keygen_party(params, out_tx, end_tx)
            .map_err(|e| MpcError::internal(format!("keygen party construction: {}", e)))?;
        self.active_keygen
            .write()
            .await
            .insert(key_id.clone(), party.clone());

        let rx = Self::take_queue_rx(&self.keygen_queues, &key_id).await?;
        let pump = self.spawn_inbound_pump(party.clone(), rx, key_id.clone());

        let start_party = party.clone();
        let start_session = key_id.clone();
        tokio::spawn(async move {
            if let Err(e) = start_party.start() {
                error!(session_id = %start_session, error = %e, "Party start failed");
            }
        });

        let result = self
            .drive(SessionKind::Keygen, &key_id, &sorted, out_rx, end_rx, &options, options.keygen_timeout)
            .await;

        // teardown: release the active slot and close the inbound queue
        self.active_keygen.write().await.remove(&key_id);
        self.keygen_queues.write().await.remove(&key_id);
        pump.abort();

        result
    }

    /// Persist the share and publish the public key through the session
    /// manager. Each participant races to complete; the first wins and the
    /// rest are rejected by the sticky session status.
    async fn publish_keygen(&self, key_id: &str, output: KeygenOutput) {
        let public_key_hex = convert::public_key_hex(&output.public_key);

        let stored = StoredKeyShare {
            key_id: key_id.to_string(),
            node_id: self.node_id.clone(),
            share: output.secret_share,
            share_index: output.share_index,
            public_key: public_key_hex.clone(),
        };
        if let Err(e) = self.vault.store(&stored) {
            error!(key_id, error = %e, "Failed to persist key share");
        }

        match self.sessions.complete_keygen(key_id, &public_key_hex).await {
            Ok(()) => info!(
                key_id,
                this_node_id = %self.node_id,
                public_key = %public_key_hex,
                "Keygen session completed"
            ),
            Err(e) => warn!(
                key_id,
                this_node_id = %self.node_id,
                error = %e,
                "Keygen completed locally but session completion was rejected"
            ),
        }
    }

    // -------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------

    /// Run threshold signing for a session and return the canonical
    /// signature. At-most-once per session on this node; a second call
    /// while a run is active is rejected.
    pub async fn execute_signing(self: &Arc<Self>, launch: SigningLaunch) -> Result<ThresholdSignature> {
        self.registry
            .ensure_supported(launch.protocol)
            .map_err(|e| MpcError::invalid(e.to_string()))?;
        validate_signing_launch(&launch)?;

        let guard = self.guard(SessionKind::Signing, &launch.session_id);
        if guard.set(()).is_err() {
            return Err(MpcError::invalid(format!(
                "signing already started for session {}",
                launch.session_id
            )));
        }

        let options = self.registry.options(launch.protocol);
        let session_id = launch.session_id.clone();

        let share = self.vault.load(&launch.key_id, &self.node_id)?;

        let sorted = sort_node_ids(&launch.node_ids);
        if !sorted.iter().any(|n| n == &self.node_id) {
            return Err(MpcError::invalid(format!(
                "node {} is not in the signing set for session {}",
                self.node_id, session_id
            )));
        }

        self.roster.register(&sorted).await;
        let parties = self
            .roster
            .sorted_party_ids(&sorted)
            .await
            .map_err(MpcError::internal)?;
        let this_party = self
            .roster
            .party_id(&self.node_id)
            .await
            .ok_or_else(|| MpcError::internal("this node has no party id"))?;

        let (out_tx, out_rx) = mpsc::channel(parties.len());
        let (end_tx, end_rx) = oneshot::channel();
        let params = SigningParams {
            session_id: session_id.clone(),
            key_id: launch.key_id.clone(),
            parties,
            this_party,
            message: launch.message.clone(),
            secret_share: share.share,
            curve: options.protocol.curve(),
        };

        let party = self
            .factory
            .new_signing_party(params, out_tx, end_tx)
            .map_err(|e| MpcError::internal(format!("signing party construction: {}", e)))?;
        self.active_signing
            .write()
            .await
            .insert(session_id.clone(), party.clone());

        let rx = Self::take_queue_rx(&self.signing_queues, &session_id).await?;
        let pump = self.spawn_inbound_pump(party.clone(), rx, session_id.clone());

        let start_party = party.clone();
        let start_session = session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = start_party.start() {
                error!(session_id = %start_session, error = %e, "Party start failed");
            }
        });

        let result = self
            .drive(
                SessionKind::Signing,
                &session_id,
                &sorted,
                out_rx,
                end_rx,
                &options,
                options.signing_timeout,
            )
            .await;

        self.active_signing.write().await.remove(&session_id);
        self.signing_queues.write().await.remove(&session_id);
        pump.abort();

        let output = result?;
        Ok(convert::signature_for(options.protocol.curve(), &output))
    }

    // -------------------------------------------------------------------
    // Pumps
    // -------------------------------------------------------------------

    /// Feed queued inbound messages into the Party. Unknown senders and
    /// rejected updates are dropped with a warning; they are never fatal to
    /// the session.
    fn spawn_inbound_pump(
        self: &Arc<Self>,
        party: Arc<dyn Party>,
        mut rx: mpsc::Receiver<IncomingMessage>,
        session_id: String,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let from = match manager.roster.party_id(&msg.from_node_id).await {
                    Some(party_id) => party_id,
                    None => {
                        warn!(
                            session_id = %session_id,
                            from_node_id = %msg.from_node_id,
                            "PartyID not found for sender, dropping message"
                        );
                        continue;
                    }
                };
                if let Err(e) = party.update_from_bytes(&msg.payload, &from, msg.is_broadcast) {
                    warn!(
                        session_id = %session_id,
                        from_node_id = %msg.from_node_id,
                        is_broadcast = msg.is_broadcast,
                        error = %e,
                        "Failed to update party from bytes"
                    );
                }
            }
        })
    }

    /// Terminal-or-error select loop: routes outbound messages while
    /// waiting for the Party to finish or the protocol deadline to pass.
    async fn drive<T>(
        &self,
        kind: SessionKind,
        session_id: &str,
        participants: &[String],
        mut out_rx: mpsc::Receiver<PartyMessage>,
        mut end_rx: oneshot::Receiver<std::result::Result<T, PartyError>>,
        options: &ProtocolOptions,
        timeout: std::time::Duration,
    ) -> Result<T> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut out_closed = false;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(MpcError::ProtocolTimeout {
                        protocol: options.protocol.as_str().to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                res = &mut end_rx => {
                    return match res {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(e)) => Err(map_party_error(e, options)),
                        Err(_) => Err(MpcError::internal(format!(
                            "{} party terminated without a result",
                            options.protocol
                        ))),
                    };
                }
                maybe = out_rx.recv(), if !out_closed => {
                    match maybe {
                        Some(msg) => self.route_outbound(kind, session_id, participants, msg).await,
                        None => out_closed = true,
                    }
                }
            }
        }
    }

    /// Resolve one outbound message: explicit targets go unicast, an empty
    /// target list broadcasts to every peer. A failed destination is logged
    /// and the remaining destinations still receive the message.
    async fn route_outbound(
        &self,
        kind: SessionKind,
        session_id: &str,
        participants: &[String],
        msg: PartyMessage,
    ) {
        if msg.to.is_empty() {
            for peer in participants {
                if peer == &self.node_id {
                    continue;
                }
                if let Err(e) = self.send(kind, session_id, peer, &msg.payload, true).await {
                    warn!(
                        session_id = %session_id,
                        target_node_id = %peer,
                        error = %e,
                        "Failed to route broadcast message, continuing"
                    );
                }
            }
            return;
        }

        for to in &msg.to {
            let target = match self.roster.node_id(&to.id).await {
                Some(target) => target,
                None => {
                    error!(
                        session_id = %session_id,
                        party_id = %to.id,
                        "No node mapping for target party, skipping"
                    );
                    continue;
                }
            };
            if let Err(e) = self.send(kind, session_id, &target, &msg.payload, false).await {
                warn!(
                    session_id = %session_id,
                    target_node_id = %target,
                    error = %e,
                    "Failed to route unicast message, continuing"
                );
            }
        }
    }

    async fn send(
        &self,
        kind: SessionKind,
        session_id: &str,
        target: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()> {
        match kind {
            SessionKind::Keygen => {
                self.router
                    .send_keygen(session_id, target, payload, is_broadcast)
                    .await
            }
            SessionKind::Signing => {
                self.router
                    .send_signing(session_id, target, payload, is_broadcast)
                    .await
            }
        }
    }
}

fn validate_keygen_launch(launch: &KeygenLaunch) -> Result<()> {
    if launch.key_id.is_empty() {
        return Err(MpcError::invalid("key ID is required"));
    }
    if launch.threshold < 2 {
        return Err(MpcError::invalid("threshold must be at least 2"));
    }
    if launch.total_nodes < launch.threshold {
        return Err(MpcError::invalid("total nodes must be at least threshold"));
    }
    if launch.node_ids.len() != launch.total_nodes {
        return Err(MpcError::invalid(format!(
            "node IDs count mismatch: expected {}, got {}",
            launch.total_nodes,
            launch.node_ids.len()
        )));
    }
    Ok(())
}

fn validate_signing_launch(launch: &SigningLaunch) -> Result<()> {
    if launch.key_id.is_empty() {
        return Err(MpcError::invalid("key ID is required"));
    }
    if launch.message.is_empty() {
        return Err(MpcError::invalid("message payload is empty"));
    }
    if launch.node_ids.is_empty() {
        return Err(MpcError::invalid("node IDs are required"));
    }
    Ok(())
}

fn map_party_error(e: PartyError, options: &ProtocolOptions) -> MpcError {
    match e {
        PartyError::Failed { reason, culprits }
            if options.identifiable_abort && !culprits.is_empty() =>
        {
            MpcError::IdentifiableAbort { reason, culprits }
        }
        other => MpcError::internal(format!("{} protocol error: {}", options.protocol, other)),
    }
}
