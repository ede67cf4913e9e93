//! Session Manager
//!
//! Authoritative cluster-wide session state. Reads go cache-first with a
//! store fallback; writes land in the durable store and refresh the cache.
//! Terminal statuses are sticky: once a session is Completed, Cancelled or
//! Timeout, nothing transitions it again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::{now_secs, MpcError, Result};
use crate::protocol::Protocol;
use crate::storage::traits::{
    KeyStore, SessionCache, SessionStore, StateStore, StorageError,
};
use crate::types::key::KeyStatus;
use crate::types::message::{RoundProgress, WalRecord};
use crate::types::session::{Session, SessionProtocol, SessionStatus};

const CREATE_MAX_RETRIES: u32 = 3;
const CREATE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Cluster-wide session state manager
pub struct SessionManager {
    keys: Arc<dyn KeyStore>,
    store: Arc<dyn SessionStore>,
    cache: Arc<dyn SessionCache>,
    state: Arc<dyn StateStore>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(
        keys: Arc<dyn KeyStore>,
        store: Arc<dyn SessionStore>,
        cache: Arc<dyn SessionCache>,
        state: Arc<dyn StateStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            keys,
            store,
            cache,
            state,
            timeout,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a DKG session. Uses the key id as session id, retries the
    /// insert to ride out placeholder-visibility races, and verifies by
    /// re-read before returning.
    pub async fn create_dkg_session(
        &self,
        key_id: &str,
        protocol: Protocol,
        threshold: usize,
        total_nodes: usize,
        node_ids: Vec<String>,
    ) -> Result<Session> {
        if node_ids.len() != total_nodes {
            return Err(MpcError::invalid(format!(
                "node IDs count mismatch: expected {}, got {}",
                total_nodes,
                node_ids.len()
            )));
        }

        let now = now_secs();
        let options = protocol.options();
        let session = Session {
            session_id: key_id.to_string(),
            key_id: key_id.to_string(),
            protocol: SessionProtocol::Keygen(protocol),
            status: SessionStatus::Pending,
            threshold,
            total_nodes,
            participating_nodes: node_ids,
            current_round: 0,
            total_rounds: options.keygen_rounds,
            signature: None,
            created_at: now,
            completed_at: None,
            duration_ms: None,
            expires_at: now + self.timeout.as_secs(),
        };

        // Retries cover replication lag between the placeholder-key insert
        // and this session insert.
        let mut delay = CREATE_RETRY_BASE;
        let mut last_err: Option<StorageError> = None;
        for attempt in 1..=CREATE_MAX_RETRIES {
            match self.store.insert_session(&session).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    if attempt < CREATE_MAX_RETRIES {
                        warn!(
                            session_id = %session.session_id,
                            key_id = %session.key_id,
                            attempt,
                            error = %e,
                            retry_delay_ms = delay.as_millis() as u64,
                            "Failed to save keygen session, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            error!(
                session_id = %session.session_id,
                key_id = %session.key_id,
                attempts = CREATE_MAX_RETRIES,
                error = %e,
                "Failed to save keygen session after all retries"
            );
            return Err(match e {
                StorageError::ForeignKey(_) => MpcError::ForeignKeyViolation(format!(
                    "key {} does not exist for DKG session. Possible causes: \
                     1) the placeholder key was never created by the coordinator, \
                     2) the key row is not yet visible due to replication lag, \
                     3) the key was deleted before the session was created",
                    key_id
                )),
                other => other.into(),
            });
        }

        // verify by re-read before returning
        let saved = self
            .store
            .get_session(&session.session_id)
            .await?
            .ok_or_else(|| {
                MpcError::internal(format!(
                    "session {} saved but verification read came back empty",
                    session.session_id
                ))
            })?;

        info!(
            session_id = %saved.session_id,
            key_id = %saved.key_id,
            protocol = %saved.protocol.tag(),
            threshold = saved.threshold,
            total_nodes = saved.total_nodes,
            participating_nodes = ?saved.participating_nodes,
            "Keygen session saved and verified"
        );

        if let Err(e) = self.cache.put_session(&saved, self.timeout).await {
            warn!(
                session_id = %saved.session_id,
                error = %e,
                "Failed to populate session cache (non-critical)"
            );
        }

        Ok(saved)
    }

    /// Create a signing session against an Active key. Signing sessions get
    /// a fresh id; participants join as they engage.
    pub async fn create_signing_session(
        &self,
        key_id: &str,
        protocol: Protocol,
        threshold: usize,
        total_nodes: usize,
    ) -> Result<Session> {
        let key = self
            .keys
            .get_key(key_id)
            .await?
            .ok_or_else(|| MpcError::KeyNotFound(key_id.to_string()))?;
        if key.status != KeyStatus::Active {
            return Err(MpcError::invalid(format!(
                "key {} is not Active (status: {})",
                key_id, key.status
            )));
        }

        let now = now_secs();
        let options = protocol.options();
        let session = Session {
            session_id: format!("session-{}", Uuid::new_v4()),
            key_id: key_id.to_string(),
            protocol: SessionProtocol::Signing(protocol),
            status: SessionStatus::Pending,
            threshold,
            total_nodes,
            participating_nodes: Vec::new(),
            current_round: 0,
            total_rounds: options.signing_rounds,
            signature: None,
            created_at: now,
            completed_at: None,
            duration_ms: None,
            expires_at: now + self.timeout.as_secs(),
        };

        self.store.insert_session(&session).await?;
        if let Err(e) = self.cache.put_session(&session, self.timeout).await {
            warn!(session_id = %session.session_id, error = %e, "Failed to populate session cache");
        }

        info!(
            session_id = %session.session_id,
            key_id = %key_id,
            protocol = %session.protocol.tag(),
            "Signing session created"
        );

        Ok(session)
    }

    /// Cache-first session read with store fallback
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        match self.cache.get_cached_session(session_id).await {
            Ok(Some(session)) => {
                debug!(session_id, "Session retrieved from cache");
                return Ok(session);
            }
            Ok(None) => {}
            Err(e) => warn!(session_id, error = %e, "Session cache read failed"),
        }

        match self.store.get_session(session_id).await? {
            Some(session) => {
                debug!(session_id, "Session retrieved from store");
                Ok(session)
            }
            None => Err(MpcError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Write an updated session to the store and refresh the cache
    pub async fn update_session(&self, session: &Session) -> Result<()> {
        self.store.update_session(session).await?;

        let remaining = session.expires_at.saturating_sub(now_secs());
        if remaining > 0 {
            if let Err(e) = self
                .cache
                .put_session(session, Duration::from_secs(remaining))
                .await
            {
                warn!(session_id = %session.session_id, error = %e, "Failed to refresh session cache");
            }
        } else if let Err(e) = self.cache.invalidate_session(&session.session_id).await {
            warn!(session_id = %session.session_id, error = %e, "Failed to invalidate session cache");
        }

        Ok(())
    }

    /// Add a node to the participant list; first join activates the session
    pub async fn join_session(&self, session_id: &str, node_id: &str) -> Result<()> {
        let mut session = self.get_session(session_id).await?;

        if !matches!(
            session.status,
            SessionStatus::Pending | SessionStatus::Active
        ) {
            return Err(MpcError::invalid(format!(
                "session is not joinable: status={}",
                session.status
            )));
        }

        if session.participating_nodes.iter().any(|n| n == node_id) {
            return Ok(()); // already joined
        }

        session.participating_nodes.push(node_id.to_string());
        session.status = SessionStatus::Active;
        self.update_session(&session).await
    }

    /// Complete a DKG session and promote the key to Active with its public
    /// key. Idempotence comes from the caller's at-most-once startup guard;
    /// a second completion attempt is rejected here.
    pub async fn complete_keygen(&self, key_id: &str, public_key_hex: &str) -> Result<()> {
        // DKG sessions use the key id as session id
        let mut session = self.get_session(key_id).await?;

        if !matches!(
            session.status,
            SessionStatus::Pending | SessionStatus::Active
        ) {
            warn!(
                key_id,
                status = %session.status,
                "Cannot complete keygen session in terminal status"
            );
            return Err(MpcError::invalid(format!(
                "cannot complete session in status {}",
                session.status
            )));
        }

        session.finish(
            SessionStatus::Completed,
            Some(public_key_hex.to_string()),
        );
        self.update_session(&session).await?;

        let mut key = self
            .keys
            .get_key(key_id)
            .await?
            .ok_or_else(|| MpcError::KeyNotFound(key_id.to_string()))?;
        let old_status = key.status;
        key.public_key = public_key_hex.to_string();
        key.status = KeyStatus::Active;
        key.updated_at = now_secs();
        self.keys.update_key(&key).await?;

        info!(
            key_id,
            old_status = %old_status,
            public_key = %public_key_hex,
            "DKG completed, key promoted to Active"
        );

        Ok(())
    }

    /// Complete a signing session with its signature
    pub async fn complete_signing(&self, session_id: &str, signature_hex: &str) -> Result<()> {
        let mut session = self.get_session(session_id).await?;

        if !matches!(
            session.status,
            SessionStatus::Pending | SessionStatus::Active
        ) {
            return Err(MpcError::invalid(format!(
                "cannot complete session in status {}",
                session.status
            )));
        }

        session.finish(SessionStatus::Completed, Some(signature_hex.to_string()));
        self.update_session(&session).await?;

        info!(session_id, "Signing session completed");
        Ok(())
    }

    /// Cancel a non-terminal session
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let mut session = self.get_session(session_id).await?;

        if session.status.is_terminal() {
            return Err(MpcError::invalid(format!(
                "cannot cancel session in status {}",
                session.status
            )));
        }

        session.finish(SessionStatus::Cancelled, None);
        self.update_session(&session).await?;

        info!(session_id, "Session cancelled");
        Ok(())
    }

    /// Transition one session to Timeout if its expiry has passed
    pub async fn check_timeout(&self, session_id: &str) -> Result<bool> {
        let mut session = self.get_session(session_id).await?;

        if session.is_expired(now_secs()) {
            session.finish(SessionStatus::Timeout, None);
            self.update_session(&session).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Sweep all expired non-terminal sessions to Timeout; returns how many
    /// transitioned
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired = self.store.expired_sessions(now_secs()).await?;
        let mut swept = 0;
        for mut session in expired {
            session.finish(SessionStatus::Timeout, None);
            match self.update_session(&session).await {
                Ok(()) => {
                    swept += 1;
                    info!(session_id = %session.session_id, "Session timed out");
                }
                Err(e) => warn!(
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to time out expired session"
                ),
            }
        }
        Ok(swept)
    }

    // Crash-recovery hooks

    pub async fn save_round_progress(&self, progress: &RoundProgress) -> Result<()> {
        Ok(self.state.save_round_progress(progress).await?)
    }

    pub async fn load_round_progress(&self, session_id: &str) -> Result<Option<RoundProgress>> {
        Ok(self.state.load_round_progress(session_id).await?)
    }

    pub async fn append_wal(&self, record: &WalRecord) -> Result<u64> {
        Ok(self.state.append_wal(record).await?)
    }

    pub async fn replay_wal(&self, session_id: &str) -> Result<Vec<WalRecord>> {
        Ok(self.state.replay_wal(session_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryCache, MemoryStore};
    use crate::types::key::{Algorithm, Curve, KeyMetadata};

    fn manager_with(store: MemoryStore, timeout: Duration) -> SessionManager {
        let store = Arc::new(store);
        SessionManager::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryCache::new()),
            store,
            timeout,
        )
    }

    async fn seed_key(manager: &SessionManager, key_id: &str, status: KeyStatus) {
        let mut key = KeyMetadata::placeholder(key_id, Algorithm::Ecdsa, Curve::Secp256k1, 2, 3);
        key.status = status;
        if status == KeyStatus::Active {
            key.public_key = "02ab".into();
        }
        manager.keys.save_key(&key).await.unwrap();
    }

    fn nodes() -> Vec<String> {
        vec!["n1".into(), "n2".into(), "n3".into()]
    }

    #[tokio::test]
    async fn test_dkg_session_uses_key_id() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(300));
        seed_key(&manager, "k-1", KeyStatus::Pending).await;

        let session = manager
            .create_dkg_session("k-1", Protocol::Gg18, 2, 3, nodes())
            .await
            .unwrap();
        assert_eq!(session.session_id, "k-1");
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.total_rounds, 4);

        // cache-first read returns it
        let fetched = manager.get_session("k-1").await.unwrap();
        assert_eq!(fetched.session_id, "k-1");
    }

    #[tokio::test]
    async fn test_dkg_session_foreign_key_diagnostics() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(300));

        let err = manager
            .create_dkg_session("absent", Protocol::Gg18, 2, 3, nodes())
            .await
            .unwrap_err();
        match err {
            MpcError::ForeignKeyViolation(msg) => {
                // the three possible causes are spelled out
                assert!(msg.contains("1)"));
                assert!(msg.contains("2)"));
                assert!(msg.contains("3)"));
            }
            other => panic!("expected ForeignKeyViolation, got {:?}", other),
        }

        // no session row is observable afterwards
        assert!(matches!(
            manager.get_session("absent").await,
            Err(MpcError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_signing_session_requires_active_key() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(300));
        seed_key(&manager, "k-1", KeyStatus::Pending).await;

        let err = manager
            .create_signing_session("k-1", Protocol::Gg18, 2, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, MpcError::InvalidRequest(_)));

        seed_key(&manager, "k-2", KeyStatus::Active).await;
        let session = manager
            .create_signing_session("k-2", Protocol::Gg18, 2, 3)
            .await
            .unwrap();
        assert!(session.session_id.starts_with("session-"));
        assert_ne!(session.session_id, session.key_id);
    }

    #[tokio::test]
    async fn test_join_transitions_pending_to_active() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(300));
        seed_key(&manager, "k-2", KeyStatus::Active).await;
        let session = manager
            .create_signing_session("k-2", Protocol::Gg18, 2, 3)
            .await
            .unwrap();

        manager.join_session(&session.session_id, "n1").await.unwrap();
        let joined = manager.get_session(&session.session_id).await.unwrap();
        assert_eq!(joined.status, SessionStatus::Active);
        assert_eq!(joined.participating_nodes, vec!["n1".to_string()]);

        // joining twice is a no-op
        manager.join_session(&session.session_id, "n1").await.unwrap();
        let joined = manager.get_session(&session.session_id).await.unwrap();
        assert_eq!(joined.participating_nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_keygen_promotes_key() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(300));
        seed_key(&manager, "k-1", KeyStatus::Pending).await;
        manager
            .create_dkg_session("k-1", Protocol::Gg18, 2, 3, nodes())
            .await
            .unwrap();

        manager.complete_keygen("k-1", "02deadbeef").await.unwrap();

        let session = manager.get_session("k-1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.signature.as_deref(), Some("02deadbeef"));
        assert!(session.completed_at.is_some());

        let key = manager.keys.get_key("k-1").await.unwrap().unwrap();
        assert_eq!(key.status, KeyStatus::Active);
        assert_eq!(key.public_key, "02deadbeef");
    }

    #[tokio::test]
    async fn test_completion_is_terminal() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(300));
        seed_key(&manager, "k-1", KeyStatus::Pending).await;
        manager
            .create_dkg_session("k-1", Protocol::Gg18, 2, 3, nodes())
            .await
            .unwrap();
        manager.complete_keygen("k-1", "02aa").await.unwrap();

        // no subsequent transition changes status or payload
        assert!(manager.complete_keygen("k-1", "02bb").await.is_err());
        assert!(manager.cancel_session("k-1").await.is_err());
        assert!(manager.join_session("k-1", "n4").await.is_err());

        let session = manager.get_session("k-1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.signature.as_deref(), Some("02aa"));
    }

    #[tokio::test]
    async fn test_timeout_sweep() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(0));
        seed_key(&manager, "k-1", KeyStatus::Pending).await;
        manager
            .create_dkg_session("k-1", Protocol::Gg18, 2, 3, nodes())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);

        let session = manager.get_session("k-1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Timeout);

        // sweep is idempotent; terminal sessions stay put
        assert_eq!(manager.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wal_passthrough() {
        let manager = manager_with(MemoryStore::new(), Duration::from_secs(300));
        let seq = manager
            .append_wal(&WalRecord {
                session_id: "s-1".into(),
                seq: 0,
                kind: "round1".into(),
                payload: vec![1],
                created_at: now_secs(),
            })
            .await
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(manager.replay_wal("s-1").await.unwrap().len(), 1);
    }
}
