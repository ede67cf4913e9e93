//! Node-to-Node RPC Client
//!
//! Resolves peers through the service registry and carries protocol
//! envelopes, the leader kick and liveness probes over HTTP JSON. Protocol
//! messages are never retried here; a failed send surfaces as a
//! `{code, recoverable}` pair and the decision belongs to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::types::{
    HeartbeatRequest, HeartbeatResponse, KeygenMessageRequest, MessageAck, SigningMessageRequest,
    StartDkgRequest, StartDkgResponse, TransportError, MAX_FRAME_BYTES,
};
use crate::common::{now_secs, MpcError, Result};
use crate::config::MpcConfig;
use crate::coordinator::DkgKick;
use crate::discovery::{Discovery, MPC_SERVICE_NAME};
use crate::party::MessageRouter;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC client for one node, shared by the outbound pumps and the
/// coordinator
pub struct NodeClient {
    node_id: String,
    http: reqwest::Client,
    scheme: &'static str,
    discovery: Arc<dyn Discovery>,
    /// nodeId → base URL, filled from discovery
    peers: RwLock<HashMap<String, String>>,
}

impl NodeClient {
    pub fn from_config(cfg: &MpcConfig, discovery: Arc<dyn Discovery>) -> Result<Self> {
        let http = super::tls::http_client(cfg.tls.as_ref(), REQUEST_TIMEOUT)
            .map_err(MpcError::Transport)?;
        Ok(Self {
            node_id: cfg.node_id.clone(),
            http,
            scheme: if cfg.tls.is_some() { "https" } else { "http" },
            discovery,
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Pin a peer address directly, bypassing discovery
    pub async fn add_peer(&self, node_id: &str, base_url: &str) {
        self.peers
            .write()
            .await
            .insert(node_id.to_string(), base_url.to_string());
    }

    /// Resolve a peer's base URL, refreshing from discovery on a miss
    async fn resolve(&self, node_id: &str) -> std::result::Result<String, TransportError> {
        if let Some(url) = self.peers.read().await.get(node_id) {
            return Ok(url.clone());
        }

        let services = self
            .discovery
            .discover(MPC_SERVICE_NAME, &[])
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let mut peers = self.peers.write().await;
        for service in &services {
            peers.insert(
                service.id.clone(),
                format!("{}://{}:{}", self.scheme, service.address, service.port),
            );
        }
        peers
            .get(node_id)
            .cloned()
            .ok_or_else(|| TransportError::PeerUnresolved(node_id.to_string()))
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        url: String,
        body: &Req,
    ) -> std::result::Result<Resp, TransportError> {
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| TransportError::Http(e.to_string()));
        }

        match response.json::<super::types::ErrorBody>().await {
            Ok(body) => Err(TransportError::Remote {
                code: body.code,
                message: body.message,
                recoverable: body.recoverable,
            }),
            Err(_) => Err(TransportError::Http(format!("{} returned {}", url, status))),
        }
    }

    fn check_frame(payload: &[u8]) -> std::result::Result<(), TransportError> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        Ok(())
    }

    /// One-shot unary DKG message send
    pub async fn send_keygen_message(
        &self,
        target_node_id: &str,
        session_id: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> std::result::Result<(), TransportError> {
        Self::check_frame(payload)?;
        let base = self.resolve(target_node_id).await?;
        let request = KeygenMessageRequest {
            session_id: session_id.to_string(),
            from_node_id: self.node_id.clone(),
            payload: hex::encode(payload),
            is_broadcast,
        };
        let ack: MessageAck = self
            .post_json(format!("{}/v1/node/keygen-message", base), &request)
            .await?;
        debug!(
            session_id,
            target_node_id,
            accepted = ack.accepted,
            "Keygen message delivered"
        );
        Ok(())
    }

    /// One-shot unary signing message send
    pub async fn send_signing_message(
        &self,
        target_node_id: &str,
        session_id: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> std::result::Result<(), TransportError> {
        Self::check_frame(payload)?;
        let base = self.resolve(target_node_id).await?;
        let request = SigningMessageRequest {
            session_id: session_id.to_string(),
            from_node_id: self.node_id.clone(),
            payload: hex::encode(payload),
            is_broadcast,
        };
        let _ack: MessageAck = self
            .post_json(format!("{}/v1/node/signing-message", base), &request)
            .await?;
        Ok(())
    }

    /// Leader kick; returns once the target has scheduled its Party
    pub async fn send_start_dkg(
        &self,
        target_node_id: &str,
        request: &StartDkgRequest,
    ) -> std::result::Result<StartDkgResponse, TransportError> {
        let base = self.resolve(target_node_id).await?;
        self.post_json(format!("{}/v1/node/start-dkg", base), request)
            .await
    }

    /// Liveness probe with a clock echo
    pub async fn heartbeat(
        &self,
        target_node_id: &str,
    ) -> std::result::Result<HeartbeatResponse, TransportError> {
        let base = self.resolve(target_node_id).await?;
        let request = HeartbeatRequest {
            node_id: self.node_id.clone(),
            sent_at: now_secs(),
            status_info: HashMap::from([("status".to_string(), "healthy".to_string())]),
        };
        let response: HeartbeatResponse = self
            .post_json(format!("{}/v1/node/heartbeat", base), &request)
            .await?;
        debug!(
            node_id = %self.node_id,
            coordinator = %response.coordinator_id,
            "Heartbeat acknowledged"
        );
        Ok(response)
    }
}

#[async_trait]
impl MessageRouter for NodeClient {
    async fn send_keygen(
        &self,
        session_id: &str,
        target_node_id: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()> {
        self.send_keygen_message(target_node_id, session_id, payload, is_broadcast)
            .await
            .map_err(MpcError::Transport)
    }

    async fn send_signing(
        &self,
        session_id: &str,
        target_node_id: &str,
        payload: &[u8],
        is_broadcast: bool,
    ) -> Result<()> {
        self.send_signing_message(target_node_id, session_id, payload, is_broadcast)
            .await
            .map_err(MpcError::Transport)
    }
}

#[async_trait]
impl DkgKick for NodeClient {
    async fn start_dkg(
        &self,
        target_node_id: &str,
        request: &StartDkgRequest,
    ) -> Result<StartDkgResponse> {
        self.send_start_dkg(target_node_id, request)
            .await
            .map_err(MpcError::Transport)
    }
}
