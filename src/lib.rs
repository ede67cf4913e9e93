//! keyquorum - Distributed Threshold-Signature Wallet Node
//!
//! A cluster of peer nodes that collectively generate ECDSA (secp256k1) and
//! EdDSA (Ed25519) keys and produce signatures such that no single node ever
//! holds the full private key. A signature exists only when at least `t` of
//! `n` nodes cooperate through a multi-round protocol (GG18, GG20 or FROST).
//!
//! ## Module Organization
//!
//! - `common/` - error taxonomy, time helpers
//! - `config` - environment-based configuration
//! - `logging` - structured logging init
//! - `types/` - keys, sessions, messages
//! - `storage/` - store traits, SQLite and in-memory backends, session cache
//! - `keyshare` - encrypted key-share vault
//! - `identity` - node-to-party identity mapping
//! - `protocol` - GG18/GG20/FROST variants and the protocol registry
//! - `party/` - the Party contract, encodings and the session multiplexer
//! - `session/` - cluster-wide session state
//! - `keys` - key metadata service
//! - `discovery/` - service registry (Consul)
//! - `coordinator` - create-key orchestration and the leader kick
//! - `participant` - inbound protocol-message handling
//! - `transport/` - node-to-node RPC server and client
//! - `node` - wiring and background loops

pub mod common;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod identity;
pub mod keys;
pub mod keyshare;
pub mod logging;
pub mod node;
pub mod participant;
pub mod party;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;

// Re-exports: core errors and results
pub use common::{MpcError, Result};

// Re-exports: configuration
pub use config::{ConfigError, MpcConfig, NodeType, TlsConfig};

// Re-exports: logging
pub use logging::{init_logging, LogLevel, LoggingError};

// Re-exports: protocol variants
pub use protocol::{Protocol, ProtocolOptions, ProtocolRegistry};

// Re-exports: data model
pub use types::{
    Algorithm, Curve, KeyMetadata, KeyStatus, Session, SessionKind, SessionProtocol, SessionStatus,
};

// Re-exports: orchestration roles
pub use coordinator::Coordinator;
pub use keys::{CreateKeyRequest, KeyService};
pub use participant::Participant;
pub use party::{
    KeygenLaunch, LocalPartyFactory, MessageRouter, PartyManager, SigningLaunch,
    ThresholdSignature,
};
pub use session::SessionManager;

// Re-exports: infrastructure
pub use discovery::{ConsulClient, Discovery, ServiceInfo, StaticDiscovery};
pub use keyshare::{KeyShareVault, StoredKeyShare};
pub use node::Node;
pub use storage::{MemoryCache, MemoryStore, SqliteStore};
pub use transport::{AppState, NodeClient};
