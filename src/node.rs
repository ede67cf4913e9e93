//! Node Wiring
//!
//! Builds a running node from configuration: stores, cache, vault, party
//! manager, roles, registry membership and the background loops. The
//! node's identity and cryptographic configuration live in one injected
//! context rather than module-level state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::common::{now_secs, MpcError, Result};
use crate::config::{MpcConfig, NodeType};
use crate::coordinator::Coordinator;
use crate::discovery::{ConsulClient, Discovery, ServiceInfo, MPC_SERVICE_NAME};
use crate::keys::KeyService;
use crate::keyshare::KeyShareVault;
use crate::party::{LocalPartyFactory, PartyFactory, PartyManager};
use crate::participant::Participant;
use crate::protocol::ProtocolRegistry;
use crate::session::SessionManager;
use crate::storage::memory::MemoryCache;
use crate::storage::sqlite::SqliteStore;
use crate::storage::traits::NodeStore;
use crate::transport::{self, AppState, NodeClient};
use crate::types::message::{NodeInfo, NodeStatus};

/// Minimum pause between heartbeats regardless of session timeout
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Sweep cadence for expired sessions
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A fully wired node ready to serve
pub struct Node {
    cfg: MpcConfig,
    state: Arc<AppState>,
    discovery: Arc<dyn Discovery>,
    client: Arc<NodeClient>,
}

impl Node {
    /// Wire every component from configuration
    pub fn build(cfg: MpcConfig) -> Result<Node> {
        let registry = ProtocolRegistry::new(cfg.supported_protocols.clone())
            .map_err(|e| MpcError::invalid(e.to_string()))?;

        let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
        let cache = Arc::new(MemoryCache::new());
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            cache,
            store.clone(),
            cfg.session_timeout,
        ));

        let vault = Arc::new(KeyShareVault::new(
            &cfg.key_share_storage_path,
            cfg.key_share_encryption_key.clone(),
        ));

        let discovery: Arc<dyn Discovery> = Arc::new(
            ConsulClient::new(cfg.consul_address.clone())
                .map_err(|e| MpcError::internal(e.to_string()))?,
        );
        let client = Arc::new(NodeClient::from_config(&cfg, discovery.clone())?);

        // The in-process factory backs development clusters; a production
        // build swaps in the external MPC library here.
        let factory: Arc<dyn PartyFactory> = Arc::new(LocalPartyFactory::new());

        let parties = PartyManager::new(
            cfg.node_id.clone(),
            registry.clone(),
            client.clone(),
            factory,
            vault,
            sessions.clone(),
        );

        let participant = Arc::new(Participant::new(
            cfg.node_id.clone(),
            sessions.clone(),
            parties.clone(),
        ));

        let keys = Arc::new(KeyService::new(store.clone()));

        let coordinator = match cfg.node_type {
            NodeType::Coordinator => Some(Arc::new(Coordinator::new(
                cfg.node_id.clone(),
                keys.clone(),
                sessions.clone(),
                discovery.clone(),
                registry,
                client.clone(),
            ))),
            NodeType::Participant => None,
        };

        let state = Arc::new(AppState {
            node_id: cfg.node_id.clone(),
            node_type: cfg.node_type,
            sessions,
            keys,
            parties,
            participant,
            coordinator,
            nodes: store,
        });

        Ok(Node {
            cfg,
            state,
            discovery,
            client,
        })
    }

    /// Register with the service registry, start the background loops and
    /// serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let service = ServiceInfo::for_node(
            &self.cfg.node_id,
            self.cfg.node_type.as_str(),
            &self.cfg.advertise_address,
            self.cfg.rpc_port,
        );
        if let Err(e) = self.discovery.register(&service).await {
            // the node can still serve traffic addressed directly to it
            warn!(error = %e, "Service registration failed, continuing without registry");
        }

        self.spawn_sweeper();
        match self.cfg.node_type {
            NodeType::Participant => self.spawn_heartbeat_loop(),
            NodeType::Coordinator => self.spawn_node_refresh_loop(),
        }

        let result = transport::serve(self.state.clone(), &self.cfg).await;

        if let Err(e) = self.discovery.deregister(&self.cfg.node_id).await {
            warn!(error = %e, "Service deregistration failed");
        }
        result
    }

    /// Periodically time out expired sessions
    fn spawn_sweeper(&self) {
        let sessions = self.state.sessions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                match sessions.sweep_expired().await {
                    Ok(0) => {}
                    Ok(swept) => info!(swept, "Expired sessions timed out"),
                    Err(e) => warn!(error = %e, "Session sweep failed"),
                }
            }
        });
    }

    /// Participants heartbeat the coordinator at an interval derived from
    /// the session timeout
    fn spawn_heartbeat_loop(&self) {
        let client = self.client.clone();
        let discovery = self.discovery.clone();
        let interval = self
            .cfg
            .session_timeout
            .checked_div(3)
            .unwrap_or(MIN_HEARTBEAT_INTERVAL)
            .max(MIN_HEARTBEAT_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let coordinators = match discovery
                    .discover(
                        MPC_SERVICE_NAME,
                        &[ServiceInfo::node_type_tag("coordinator")],
                    )
                    .await
                {
                    Ok(coordinators) => coordinators,
                    Err(e) => {
                        warn!(error = %e, "Coordinator discovery failed");
                        continue;
                    }
                };

                for coordinator in coordinators {
                    if let Err(e) = client.heartbeat(&coordinator.id).await {
                        warn!(
                            coordinator_id = %coordinator.id,
                            error = %e,
                            "Heartbeat failed"
                        );
                    }
                }
            }
        });
    }

    /// The coordinator caches registry membership in the nodes table
    fn spawn_node_refresh_loop(&self) {
        let discovery = self.discovery.clone();
        let nodes: Arc<dyn NodeStore> = self.state.nodes.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let services = match discovery.discover(MPC_SERVICE_NAME, &[]).await {
                    Ok(services) => services,
                    Err(e) => {
                        warn!(error = %e, "Registry refresh failed");
                        continue;
                    }
                };

                for service in services {
                    let record = NodeInfo {
                        node_id: service.id.clone(),
                        node_type: service.node_type().unwrap_or("participant").to_string(),
                        address: service.address.clone(),
                        port: service.port,
                        status: NodeStatus::Active,
                        last_seen: now_secs(),
                    };
                    if let Err(e) = nodes.upsert_node(&record).await {
                        error!(node_id = %record.node_id, error = %e, "Node cache update failed");
                    }
                }
            }
        });
    }
}
