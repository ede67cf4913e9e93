//! In-Memory Storage Implementations
//!
//! Backs tests and single-node development. The store enforces the same
//! referential constraint as the SQLite implementation so foreign-key
//! behavior can be exercised without a database file.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::traits::{
    KeyFilter, KeyStore, NodeStore, SessionCache, SessionStore, StateStore, StorageError,
    StorageResult,
};
use crate::types::key::KeyMetadata;
use crate::types::message::{NodeInfo, RoundProgress, WalRecord};
use crate::types::session::Session;

/// In-memory store implementing every storage trait
///
/// Clones share state, mirroring a cluster of nodes pointed at one shared
/// database.
#[derive(Clone)]
pub struct MemoryStore {
    keys: Arc<RwLock<HashMap<String, KeyMetadata>>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    nodes: Arc<RwLock<HashMap<String, NodeInfo>>>,
    progress: Arc<RwLock<HashMap<String, RoundProgress>>>,
    wal: Arc<RwLock<Vec<WalRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            nodes: Arc::new(RwLock::new(HashMap::new())),
            progress: Arc::new(RwLock::new(HashMap::new())),
            wal: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn save_key(&self, key: &KeyMetadata) -> StorageResult<()> {
        self.keys
            .write()
            .await
            .insert(key.key_id.clone(), key.clone());
        Ok(())
    }

    async fn update_key(&self, key: &KeyMetadata) -> StorageResult<()> {
        let mut keys = self.keys.write().await;
        if !keys.contains_key(&key.key_id) {
            return Err(StorageError::NotFound(key.key_id.clone()));
        }
        keys.insert(key.key_id.clone(), key.clone());
        Ok(())
    }

    async fn get_key(&self, key_id: &str) -> StorageResult<Option<KeyMetadata>> {
        Ok(self.keys.read().await.get(key_id).cloned())
    }

    async fn list_keys(&self, filter: &KeyFilter) -> StorageResult<Vec<KeyMetadata>> {
        let keys = self.keys.read().await;
        Ok(keys
            .values()
            .filter(|k| filter.status.map_or(true, |s| k.status == s))
            .filter(|k| {
                filter
                    .chain_type
                    .as_ref()
                    .map_or(true, |c| k.chain_type.as_deref() == Some(c.as_str()))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> StorageResult<()> {
        // referential constraint, same as the SQLite foreign key
        if !self.keys.read().await.contains_key(&session.key_id) {
            return Err(StorageError::ForeignKey(format!(
                "key_id {} does not exist in keys table",
                session.key_id
            )));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(StorageError::Duplicate(session.session_id.clone()));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> StorageResult<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&session.session_id) {
            return Err(StorageError::NotFound(session.session_id.clone()));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn expired_sessions(&self, now: u64) -> StorageResult<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_expired(now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn upsert_node(&self, node: &NodeInfo) -> StorageResult<()> {
        self.nodes
            .write()
            .await
            .insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> StorageResult<Option<NodeInfo>> {
        Ok(self.nodes.read().await.get(node_id).cloned())
    }

    async fn list_nodes(&self) -> StorageResult<Vec<NodeInfo>> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_round_progress(&self, progress: &RoundProgress) -> StorageResult<()> {
        self.progress
            .write()
            .await
            .insert(progress.session_id.clone(), progress.clone());
        Ok(())
    }

    async fn load_round_progress(&self, session_id: &str) -> StorageResult<Option<RoundProgress>> {
        Ok(self.progress.read().await.get(session_id).cloned())
    }

    async fn append_wal(&self, record: &WalRecord) -> StorageResult<u64> {
        let mut wal = self.wal.write().await;
        let seq = wal.len() as u64 + 1;
        let mut stored = record.clone();
        stored.seq = seq;
        wal.push(stored);
        Ok(seq)
    }

    async fn replay_wal(&self, session_id: &str) -> StorageResult<Vec<WalRecord>> {
        Ok(self
            .wal
            .read()
            .await
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}

/// TTL-bounded in-process session cache
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, (Session, Instant)>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn put_session(&self, session: &Session, ttl: Duration) -> StorageResult<()> {
        let deadline = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(session.session_id.clone(), (session.clone(), deadline));
        Ok(())
    }

    async fn get_cached_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        let mut entries = self.entries.write().await;
        match entries.get(session_id) {
            Some((session, deadline)) if *deadline > Instant::now() => Ok(Some(session.clone())),
            Some(_) => {
                entries.remove(session_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn invalidate_session(&self, session_id: &str) -> StorageResult<()> {
        self.entries.write().await.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::now_secs;
    use crate::protocol::Protocol;
    use crate::types::key::{Algorithm, Curve};
    use crate::types::session::{SessionProtocol, SessionStatus};

    fn test_key(key_id: &str) -> KeyMetadata {
        KeyMetadata::placeholder(key_id, Algorithm::Ecdsa, Curve::Secp256k1, 2, 3)
    }

    fn test_session(session_id: &str, key_id: &str) -> Session {
        let now = now_secs();
        Session {
            session_id: session_id.to_string(),
            key_id: key_id.to_string(),
            protocol: SessionProtocol::Keygen(Protocol::Gg18),
            status: SessionStatus::Pending,
            threshold: 2,
            total_nodes: 3,
            participating_nodes: vec!["n1".into(), "n2".into(), "n3".into()],
            current_round: 0,
            total_rounds: 4,
            signature: None,
            created_at: now,
            completed_at: None,
            duration_ms: None,
            expires_at: now + 300,
        }
    }

    #[tokio::test]
    async fn test_session_requires_key() {
        let store = MemoryStore::new();
        let result = store.insert_session(&test_session("k-1", "k-1")).await;
        assert!(matches!(result, Err(StorageError::ForeignKey(_))));

        // key in place, insert succeeds
        store.save_key(&test_key("k-1")).await.unwrap();
        store.insert_session(&test_session("k-1", "k-1")).await.unwrap();

        // and the second insert is a duplicate
        let result = store.insert_session(&test_session("k-1", "k-1")).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_expired_sessions() {
        let store = MemoryStore::new();
        store.save_key(&test_key("k-1")).await.unwrap();
        let mut session = test_session("k-1", "k-1");
        session.expires_at = now_secs().saturating_sub(10);
        store.insert_session(&session).await.unwrap();

        let expired = store.expired_sessions(now_secs()).await.unwrap();
        assert_eq!(expired.len(), 1);

        // terminal sessions are never reported
        let mut done = expired[0].clone();
        done.status = SessionStatus::Completed;
        store.update_session(&done).await.unwrap();
        assert!(store.expired_sessions(now_secs()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_ttl() {
        let cache = MemoryCache::new();
        let session = test_session("s-1", "k-1");

        cache
            .put_session(&session, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(cache.get_cached_session("s-1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get_cached_session("s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wal_append_order() {
        let store = MemoryStore::new();
        for i in 0..3u64 {
            let record = WalRecord {
                session_id: "s-1".into(),
                seq: 0,
                kind: "round".into(),
                payload: vec![i as u8],
                created_at: now_secs(),
            };
            let seq = store.append_wal(&record).await.unwrap();
            assert_eq!(seq, i + 1);
        }
        let replayed = store.replay_wal("s-1").await.unwrap();
        assert_eq!(replayed.len(), 3);
        assert!(replayed.windows(2).all(|w| w[0].seq < w[1].seq));
    }
}
