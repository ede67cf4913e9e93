//! Storage Trait Definitions
//!
//! Abstract interfaces over the durable store and the latency cache.
//! Implementations: SQLite (production) and in-memory (testing).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::key::{KeyMetadata, KeyStatus};
use crate::types::message::{NodeInfo, RoundProgress, WalRecord};
use crate::types::session::Session;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// A session insert referenced a key id absent from the keys table.
    /// Kept distinct so upper layers can diagnose races between placeholder
    /// creation and session creation.
    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Filter for key listings
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub status: Option<KeyStatus>,
    pub chain_type: Option<String>,
}

/// Key metadata storage interface
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert or replace a key record
    async fn save_key(&self, key: &KeyMetadata) -> StorageResult<()>;

    /// Update an existing key record
    async fn update_key(&self, key: &KeyMetadata) -> StorageResult<()>;

    /// Get a key by id
    async fn get_key(&self, key_id: &str) -> StorageResult<Option<KeyMetadata>>;

    /// List keys matching a filter
    async fn list_keys(&self, filter: &KeyFilter) -> StorageResult<Vec<KeyMetadata>>;
}

/// Session storage interface
///
/// Inserts MUST enforce the `key_id → keys` referential constraint and
/// surface violations as [`StorageError::ForeignKey`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session row
    async fn insert_session(&self, session: &Session) -> StorageResult<()>;

    /// Update an existing session row
    async fn update_session(&self, session: &Session) -> StorageResult<()>;

    /// Get a session by id
    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>>;

    /// Non-terminal sessions whose expiry has passed
    async fn expired_sessions(&self, now: u64) -> StorageResult<Vec<Session>>;
}

/// Latency cache in front of the session store
///
/// Populated from the write path, invalidated on update; a miss here falls
/// through to the durable store.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn put_session(&self, session: &Session, ttl: Duration) -> StorageResult<()>;

    async fn get_cached_session(&self, session_id: &str) -> StorageResult<Option<Session>>;

    async fn invalidate_session(&self, session_id: &str) -> StorageResult<()>;
}

/// Discovery-cache storage for cluster nodes
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn upsert_node(&self, node: &NodeInfo) -> StorageResult<()>;

    async fn get_node(&self, node_id: &str) -> StorageResult<Option<NodeInfo>>;

    async fn list_nodes(&self) -> StorageResult<Vec<NodeInfo>>;
}

/// Crash-recovery persistence for in-flight round data
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_round_progress(&self, progress: &RoundProgress) -> StorageResult<()>;

    async fn load_round_progress(&self, session_id: &str) -> StorageResult<Option<RoundProgress>>;

    /// Append a WAL record, returning its assigned sequence number.
    /// The WAL is append-only per session.
    async fn append_wal(&self, record: &WalRecord) -> StorageResult<u64>;

    /// Replay all WAL records for a session in append order
    async fn replay_wal(&self, session_id: &str) -> StorageResult<Vec<WalRecord>>;
}
