//! SQLite Persistent Storage
//!
//! Durable storage for keys, sessions, node records and crash-recovery
//! state. Uses connection pooling via r2d2 for concurrent access. Foreign
//! keys are enabled on every pooled connection so the
//! `signing_sessions.key_id → keys.key_id` constraint is enforced by the
//! database and surfaced as [`StorageError::ForeignKey`].

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::traits::{
    KeyFilter, KeyStore, NodeStore, SessionStore, StateStore, StorageError, StorageResult,
};
use crate::types::key::KeyMetadata;
use crate::types::message::{NodeInfo, RoundProgress, WalRecord};
use crate::types::session::{Session, SessionProtocol};

// SQLite extended result codes
const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = 787;
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

#[derive(Debug)]
struct ForeignKeysEnabled;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for ForeignKeysEnabled {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
    }
}

/// SQLite-backed store with connection pooling
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .connection_customizer(Box::new(ForeignKeysEnabled))
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .connection_customizer(Box::new(ForeignKeysEnabled))
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                key_id TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                curve TEXT NOT NULL,
                threshold INTEGER NOT NULL,
                total_nodes INTEGER NOT NULL,
                chain_type TEXT,
                address TEXT,
                status TEXT NOT NULL,
                description TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS signing_sessions (
                session_id TEXT PRIMARY KEY,
                key_id TEXT NOT NULL REFERENCES keys(key_id),
                protocol TEXT NOT NULL,
                status TEXT NOT NULL,
                threshold INTEGER NOT NULL,
                total_nodes INTEGER NOT NULL,
                participating_nodes TEXT NOT NULL DEFAULT '[]',
                current_round INTEGER NOT NULL DEFAULT 0,
                total_rounds INTEGER NOT NULL DEFAULT 0,
                signature TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                duration_ms INTEGER,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON signing_sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_key_id ON signing_sessions(key_id);
            CREATE INDEX IF NOT EXISTS idx_keys_status ON keys(status);

            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                node_type TEXT NOT NULL,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_seen INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS round_progress (
                session_id TEXT PRIMARY KEY,
                protocol TEXT NOT NULL,
                round INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_wal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_wal_session_id ON session_wal(session_id);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<KeyMetadata> {
        let algorithm: String = row.get("algorithm")?;
        let curve: String = row.get("curve")?;
        let status: String = row.get("status")?;
        let tags_json: String = row.get("tags")?;

        Ok(KeyMetadata {
            key_id: row.get("key_id")?,
            public_key: row.get("public_key")?,
            algorithm: algorithm.parse().unwrap_or(crate::types::key::Algorithm::Ecdsa),
            curve: curve.parse().unwrap_or(crate::types::key::Curve::Secp256k1),
            threshold: row.get::<_, i64>("threshold")? as usize,
            total_nodes: row.get::<_, i64>("total_nodes")? as usize,
            chain_type: row.get("chain_type")?,
            address: row.get("address")?,
            status: status.parse().unwrap_or(crate::types::key::KeyStatus::Pending),
            description: row.get("description")?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
            deleted_at: row.get::<_, Option<i64>>("deleted_at")?.map(|v| v as u64),
        })
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<(Session, String)> {
        let protocol_tag: String = row.get("protocol")?;
        let status: String = row.get("status")?;
        let nodes_json: String = row.get("participating_nodes")?;

        let session = Session {
            session_id: row.get("session_id")?,
            key_id: row.get("key_id")?,
            // placeholder; re-parsed from the tag by the caller
            protocol: SessionProtocol::Keygen(crate::protocol::Protocol::Gg18),
            status: status
                .parse()
                .unwrap_or(crate::types::session::SessionStatus::Pending),
            threshold: row.get::<_, i64>("threshold")? as usize,
            total_nodes: row.get::<_, i64>("total_nodes")? as usize,
            participating_nodes: serde_json::from_str(&nodes_json).unwrap_or_default(),
            current_round: row.get::<_, i64>("current_round")? as u32,
            total_rounds: row.get::<_, i64>("total_rounds")? as u32,
            signature: row.get("signature")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            completed_at: row.get::<_, Option<i64>>("completed_at")?.map(|v| v as u64),
            duration_ms: row.get::<_, Option<i64>>("duration_ms")?.map(|v| v as u64),
            expires_at: row.get::<_, i64>("expires_at")? as u64,
        };

        Ok((session, protocol_tag))
    }

    fn finish_session(parts: (Session, String)) -> StorageResult<Session> {
        let (mut session, tag) = parts;
        session.protocol = SessionProtocol::parse(&tag)
            .map_err(|e| StorageError::InvalidData(format!("bad protocol tag: {}", e)))?;
        Ok(session)
    }
}

/// Map a rusqlite error onto the storage taxonomy
fn map_sqlite_error(e: rusqlite::Error, context: &str) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        match err.extended_code {
            SQLITE_CONSTRAINT_FOREIGNKEY => {
                return StorageError::ForeignKey(context.to_string());
            }
            SQLITE_CONSTRAINT_PRIMARYKEY | SQLITE_CONSTRAINT_UNIQUE => {
                return StorageError::Duplicate(context.to_string());
            }
            _ => {}
        }
    }
    StorageError::Database(e.to_string())
}

#[async_trait]
impl KeyStore for SqliteStore {
    async fn save_key(&self, key: &KeyMetadata) -> StorageResult<()> {
        let conn = self.conn()?;
        let tags_json = serde_json::to_string(&key.tags)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO keys (
                key_id, public_key, algorithm, curve, threshold, total_nodes,
                chain_type, address, status, description, tags,
                created_at, updated_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT (key_id) DO UPDATE SET
                public_key = excluded.public_key,
                algorithm = excluded.algorithm,
                curve = excluded.curve,
                threshold = excluded.threshold,
                total_nodes = excluded.total_nodes,
                chain_type = excluded.chain_type,
                address = excluded.address,
                status = excluded.status,
                description = excluded.description,
                tags = excluded.tags,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at
            "#,
            params![
                key.key_id,
                key.public_key,
                key.algorithm.as_str(),
                key.curve.as_str(),
                key.threshold as i64,
                key.total_nodes as i64,
                key.chain_type,
                key.address,
                key.status.as_str(),
                key.description,
                tags_json,
                key.created_at as i64,
                key.updated_at as i64,
                key.deleted_at.map(|v| v as i64),
            ],
        )
        .map_err(|e| map_sqlite_error(e, &key.key_id))?;

        Ok(())
    }

    async fn update_key(&self, key: &KeyMetadata) -> StorageResult<()> {
        let conn = self.conn()?;
        let tags_json = serde_json::to_string(&key.tags)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        let rows = conn
            .execute(
                r#"
                UPDATE keys SET
                    public_key = ?2, algorithm = ?3, curve = ?4, threshold = ?5,
                    total_nodes = ?6, chain_type = ?7, address = ?8, status = ?9,
                    description = ?10, tags = ?11, updated_at = ?12, deleted_at = ?13
                WHERE key_id = ?1
                "#,
                params![
                    key.key_id,
                    key.public_key,
                    key.algorithm.as_str(),
                    key.curve.as_str(),
                    key.threshold as i64,
                    key.total_nodes as i64,
                    key.chain_type,
                    key.address,
                    key.status.as_str(),
                    key.description,
                    tags_json,
                    key.updated_at as i64,
                    key.deleted_at.map(|v| v as i64),
                ],
            )
            .map_err(|e| map_sqlite_error(e, &key.key_id))?;

        if rows == 0 {
            return Err(StorageError::NotFound(key.key_id.clone()));
        }
        Ok(())
    }

    async fn get_key(&self, key_id: &str) -> StorageResult<Option<KeyMetadata>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM keys WHERE key_id = ?1",
            params![key_id],
            Self::row_to_key,
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn list_keys(&self, filter: &KeyFilter) -> StorageResult<Vec<KeyMetadata>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM keys ORDER BY created_at DESC")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let keys = stmt
            .query_map([], Self::row_to_key)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(keys
            .into_iter()
            .filter(|k| filter.status.map_or(true, |s| k.status == s))
            .filter(|k| {
                filter
                    .chain_type
                    .as_ref()
                    .map_or(true, |c| k.chain_type.as_deref() == Some(c.as_str()))
            })
            .collect())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert_session(&self, session: &Session) -> StorageResult<()> {
        let conn = self.conn()?;
        let nodes_json = serde_json::to_string(&session.participating_nodes)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO signing_sessions (
                session_id, key_id, protocol, status, threshold, total_nodes,
                participating_nodes, current_round, total_rounds, signature,
                created_at, completed_at, duration_ms, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                session.session_id,
                session.key_id,
                session.protocol.tag(),
                session.status.as_str(),
                session.threshold as i64,
                session.total_nodes as i64,
                nodes_json,
                session.current_round as i64,
                session.total_rounds as i64,
                session.signature,
                session.created_at as i64,
                session.completed_at.map(|v| v as i64),
                session.duration_ms.map(|v| v as i64),
                session.expires_at as i64,
            ],
        )
        .map_err(|e| {
            map_sqlite_error(
                e,
                &format!(
                    "key_id {} does not exist in keys table (session {})",
                    session.key_id, session.session_id
                ),
            )
        })?;

        Ok(())
    }

    async fn update_session(&self, session: &Session) -> StorageResult<()> {
        let conn = self.conn()?;
        let nodes_json = serde_json::to_string(&session.participating_nodes)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        let rows = conn
            .execute(
                r#"
                UPDATE signing_sessions SET
                    protocol = ?2, status = ?3, threshold = ?4, total_nodes = ?5,
                    participating_nodes = ?6, current_round = ?7, total_rounds = ?8,
                    signature = ?9, completed_at = ?10, duration_ms = ?11, expires_at = ?12
                WHERE session_id = ?1
                "#,
                params![
                    session.session_id,
                    session.protocol.tag(),
                    session.status.as_str(),
                    session.threshold as i64,
                    session.total_nodes as i64,
                    nodes_json,
                    session.current_round as i64,
                    session.total_rounds as i64,
                    session.signature,
                    session.completed_at.map(|v| v as i64),
                    session.duration_ms.map(|v| v as i64),
                    session.expires_at as i64,
                ],
            )
            .map_err(|e| map_sqlite_error(e, &session.session_id))?;

        if rows == 0 {
            return Err(StorageError::NotFound(session.session_id.clone()));
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        let conn = self.conn()?;
        let parts = conn
            .query_row(
                "SELECT * FROM signing_sessions WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        parts.map(Self::finish_session).transpose()
    }

    async fn expired_sessions(&self, now: u64) -> StorageResult<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT * FROM signing_sessions
                WHERE expires_at < ?1 AND status IN ('Pending', 'Active')
                "#,
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![now as i64], Self::row_to_session)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.into_iter().map(Self::finish_session).collect()
    }
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn upsert_node(&self, node: &NodeInfo) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO nodes (node_id, node_type, address, port, status, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (node_id) DO UPDATE SET
                node_type = excluded.node_type,
                address = excluded.address,
                port = excluded.port,
                status = excluded.status,
                last_seen = excluded.last_seen
            "#,
            params![
                node.node_id,
                node.node_type,
                node.address,
                node.port as i64,
                node.status.as_str(),
                node.last_seen as i64,
            ],
        )
        .map_err(|e| map_sqlite_error(e, &node.node_id))?;
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> StorageResult<Option<NodeInfo>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM nodes WHERE node_id = ?1",
            params![node_id],
            row_to_node,
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn list_nodes(&self) -> StorageResult<Vec<NodeInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM nodes ORDER BY node_id")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let result = stmt
            .query_map([], row_to_node)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()));
        result
    }
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<NodeInfo> {
    let status: String = row.get("status")?;
    Ok(NodeInfo {
        node_id: row.get("node_id")?,
        node_type: row.get("node_type")?,
        address: row.get("address")?,
        port: row.get::<_, i64>("port")? as u16,
        status: status
            .parse()
            .unwrap_or(crate::types::message::NodeStatus::Inactive),
        last_seen: row.get::<_, i64>("last_seen")? as u64,
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn save_round_progress(&self, progress: &RoundProgress) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO round_progress (session_id, protocol, round, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (session_id) DO UPDATE SET
                protocol = excluded.protocol,
                round = excluded.round,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
            params![
                progress.session_id,
                progress.protocol,
                progress.round as i64,
                hex::encode(&progress.payload),
                progress.updated_at as i64,
            ],
        )
        .map_err(|e| map_sqlite_error(e, &progress.session_id))?;
        Ok(())
    }

    async fn load_round_progress(&self, session_id: &str) -> StorageResult<Option<RoundProgress>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT * FROM round_progress WHERE session_id = ?1",
                params![session_id],
                |row| {
                    let payload_hex: String = row.get("payload")?;
                    Ok((
                        row.get::<_, String>("session_id")?,
                        row.get::<_, String>("protocol")?,
                        row.get::<_, i64>("round")?,
                        payload_hex,
                        row.get::<_, i64>("updated_at")?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        row.map(|(session_id, protocol, round, payload_hex, updated_at)| {
            Ok(RoundProgress {
                session_id,
                protocol,
                round: round as u32,
                payload: hex::decode(&payload_hex)
                    .map_err(|e| StorageError::InvalidData(e.to_string()))?,
                updated_at: updated_at as u64,
            })
        })
        .transpose()
    }

    async fn append_wal(&self, record: &WalRecord) -> StorageResult<u64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO session_wal (session_id, kind, payload, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.session_id,
                record.kind,
                hex::encode(&record.payload),
                record.created_at as i64,
            ],
        )
        .map_err(|e| map_sqlite_error(e, &record.session_id))?;

        Ok(conn.last_insert_rowid() as u64)
    }

    async fn replay_wal(&self, session_id: &str) -> StorageResult<Vec<WalRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, kind, payload, created_at
                 FROM session_wal WHERE session_id = ?1 ORDER BY id",
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>("id")?,
                    row.get::<_, String>("session_id")?,
                    row.get::<_, String>("kind")?,
                    row.get::<_, String>("payload")?,
                    row.get::<_, i64>("created_at")?,
                ))
            })
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|(id, session_id, kind, payload_hex, created_at)| {
                Ok(WalRecord {
                    session_id,
                    seq: id as u64,
                    kind,
                    payload: hex::decode(&payload_hex)
                        .map_err(|e| StorageError::InvalidData(e.to_string()))?,
                    created_at: created_at as u64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::now_secs;
    use crate::protocol::Protocol;
    use crate::types::key::{Algorithm, Curve, KeyStatus};
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
    async fn test_key_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut key = test_key("k-1");
        key.tags = vec!["custody".into()];
        store.save_key(&key).await.unwrap();

        let loaded = store.get_key("k-1").await.unwrap().unwrap();
        assert_eq!(loaded.key_id, "k-1");
        assert_eq!(loaded.status, KeyStatus::Pending);
        assert_eq!(loaded.tags, vec!["custody".to_string()]);

        // upsert replaces
        key.status = KeyStatus::Active;
        key.public_key = "02abcd".into();
        store.save_key(&key).await.unwrap();
        let loaded = store.get_key("k-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, KeyStatus::Active);
        assert_eq!(loaded.public_key, "02abcd");
    }

    #[tokio::test]
    async fn test_session_foreign_key_enforced() {
        let store = SqliteStore::in_memory().unwrap();

        // no key row yet: the insert must fail with the FK kind
        let result = store.insert_session(&test_session("absent", "absent")).await;
        assert!(matches!(result, Err(StorageError::ForeignKey(_))));

        // and no session row is observable afterwards
        assert!(store.get_session("absent").await.unwrap().is_none());

        store.save_key(&test_key("k-1")).await.unwrap();
        store.insert_session(&test_session("k-1", "k-1")).await.unwrap();
        let loaded = store.get_session("k-1").await.unwrap().unwrap();
        assert_eq!(loaded.protocol, SessionProtocol::Keygen(Protocol::Gg18));
        assert_eq!(loaded.participating_nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_session() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_key(&test_key("k-1")).await.unwrap();
        store.insert_session(&test_session("k-1", "k-1")).await.unwrap();
        let result = store.insert_session(&test_session("k-1", "k-1")).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_expired_sessions_skip_terminal() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_key(&test_key("k-1")).await.unwrap();

        let mut session = test_session("k-1", "k-1");
        session.expires_at = 1;
        store.insert_session(&session).await.unwrap();
        assert_eq!(store.expired_sessions(now_secs()).await.unwrap().len(), 1);

        session.status = SessionStatus::Cancelled;
        store.update_session(&session).await.unwrap();
        assert!(store.expired_sessions(now_secs()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wal_and_round_progress() {
        let store = SqliteStore::in_memory().unwrap();

        let progress = RoundProgress {
            session_id: "s-1".into(),
            protocol: "gg18".into(),
            round: 2,
            payload: vec![1, 2, 3],
            updated_at: now_secs(),
        };
        store.save_round_progress(&progress).await.unwrap();
        let loaded = store.load_round_progress("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.round, 2);
        assert_eq!(loaded.payload, vec![1, 2, 3]);

        let seq1 = store
            .append_wal(&WalRecord {
                session_id: "s-1".into(),
                seq: 0,
                kind: "round".into(),
                payload: vec![9],
                created_at: now_secs(),
            })
            .await
            .unwrap();
        let seq2 = store
            .append_wal(&WalRecord {
                session_id: "s-1".into(),
                seq: 0,
                kind: "round".into(),
                payload: vec![10],
                created_at: now_secs(),
            })
            .await
            .unwrap();
        assert!(seq2 > seq1);

        let replayed = store.replay_wal("s-1").await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].payload, vec![9]);
    }

    #[tokio::test]
    async fn test_node_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let mut node = NodeInfo {
            node_id: "n1".into(),
            node_type: "participant".into(),
            address: "10.0.0.1".into(),
            port: 9000,
            status: crate::types::message::NodeStatus::Active,
            last_seen: now_secs(),
        };
        store.upsert_node(&node).await.unwrap();

        node.port = 9001;
        store.upsert_node(&node).await.unwrap();
        let loaded = store.get_node("n1").await.unwrap().unwrap();
        assert_eq!(loaded.port, 9001);
        assert_eq!(store.list_nodes().await.unwrap().len(), 1);
    }
}
