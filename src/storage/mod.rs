//! Storage Layer
//!
//! Trait-based stores with SQLite (production) and in-memory (testing)
//! implementations, plus the TTL session cache.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::{MemoryCache, MemoryStore};
pub use sqlite::SqliteStore;
pub use traits::{
    KeyFilter, KeyStore, NodeStore, SessionCache, SessionStore, StateStore, StorageError,
    StorageResult,
};
