//! Environment-based Configuration for the MPC Node
//!
//! All configuration comes from environment variables. Sensitive values
//! (the key-share encryption key, TLS private keys) are only ever referenced
//! by path or read at startup, never logged.
//!
//! # Recognized Environment Variables
//!
//! ## Identity
//! - `MPC_NODE_ID` - this node's identity; mandatory for participants
//! - `MPC_NODE_TYPE` - "coordinator" or "participant" (default: "participant")
//!
//! ## Transport
//! - `MPC_RPC_PORT` - listen port for node-to-node RPC (default: 9000)
//! - `MPC_ADVERTISE_ADDRESS` - address other nodes reach us at (default: 127.0.0.1)
//! - `MPC_TLS_ENABLED` - "1" to require TLS 1.3 mutual auth
//! - `MPC_TLS_CERT_FILE`, `MPC_TLS_KEY_FILE`, `MPC_TLS_CA_CERT_FILE`
//!
//! ## Protocol
//! - `MPC_SUPPORTED_PROTOCOLS` - comma-separated subset of {gg18, gg20, frost}
//! - `MPC_SESSION_TIMEOUT` - seconds; governs session expiry and heartbeats
//!
//! ## Storage
//! - `MPC_DB_PATH` - SQLite database path (default: data/keyquorum.db)
//! - `MPC_KEY_SHARE_STORAGE_PATH` - directory for encrypted key shares
//! - `MPC_KEY_SHARE_ENCRYPTION_KEY` - symmetric key for shares at rest
//!
//! ## Services
//! - `MPC_CONSUL_ADDRESS` - service registry endpoint (default: http://127.0.0.1:8500)
//! - `MPC_LOG_LEVEL` - trace/debug/info/warn/error (default: info)
//! - `MPC_LOG_JSON` - "1" for JSON log output

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::Protocol;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("TLS configuration incomplete: {0}")]
    TlsIncomplete(String),
}

/// Role this node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Coordinator,
    Participant,
}

impl FromStr for NodeType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coordinator" => Ok(NodeType::Coordinator),
            "participant" => Ok(NodeType::Participant),
            _ => Err(ConfigError::InvalidValue(
                "MPC_NODE_TYPE".to_string(),
                format!("unknown node type: {}", s),
            )),
        }
    }
}

impl NodeType {
    /// Tag value used in the service registry
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Coordinator => "coordinator",
            NodeType::Participant => "participant",
        }
    }
}

/// TLS material for mutual-auth transport
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_cert_file: Option<String>,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct MpcConfig {
    /// This node's identity
    pub node_id: String,

    /// Role in the cluster
    pub node_type: NodeType,

    /// Node-to-node RPC listen port
    pub rpc_port: u16,

    /// Address peers use to reach this node
    pub advertise_address: String,

    /// TLS 1.3 mutual auth; None means plaintext transport is permitted
    pub tls: Option<TlsConfig>,

    /// Protocols this node will run
    pub supported_protocols: Vec<Protocol>,

    /// Session lifetime; also drives the heartbeat interval
    pub session_timeout: Duration,

    /// SQLite database path
    pub db_path: String,

    /// Directory for encrypted key-share files
    pub key_share_storage_path: String,

    /// Symmetric key protecting shares at rest
    pub key_share_encryption_key: String,

    /// Service registry endpoint
    pub consul_address: String,

    /// Log level
    pub log_level: String,

    /// JSON log output
    pub log_json: bool,
}

impl MpcConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id =
            env::var("MPC_NODE_ID").map_err(|_| ConfigError::MissingEnvVar("MPC_NODE_ID".to_string()))?;

        let node_type: NodeType = env::var("MPC_NODE_TYPE")
            .unwrap_or_else(|_| "participant".to_string())
            .parse()?;

        let rpc_port: u16 = env::var("MPC_RPC_PORT")
            .unwrap_or_else(|_| "9000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue("MPC_RPC_PORT".to_string(), "must be a port number".to_string())
            })?;

        let advertise_address =
            env::var("MPC_ADVERTISE_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());

        let tls = load_tls_config()?;

        let supported_protocols = parse_protocols(
            &env::var("MPC_SUPPORTED_PROTOCOLS").unwrap_or_else(|_| "gg18,gg20,frost".to_string()),
        )?;
        if supported_protocols.is_empty() {
            return Err(ConfigError::InvalidValue(
                "MPC_SUPPORTED_PROTOCOLS".to_string(),
                "at least one protocol is required".to_string(),
            ));
        }

        let timeout_secs: u64 = env::var("MPC_SESSION_TIMEOUT")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "MPC_SESSION_TIMEOUT".to_string(),
                    "must be a number of seconds".to_string(),
                )
            })?;

        let db_path = env::var("MPC_DB_PATH").unwrap_or_else(|_| "data/keyquorum.db".to_string());

        let key_share_storage_path =
            env::var("MPC_KEY_SHARE_STORAGE_PATH").unwrap_or_else(|_| "data/shares".to_string());

        let key_share_encryption_key = env::var("MPC_KEY_SHARE_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("MPC_KEY_SHARE_ENCRYPTION_KEY".to_string()))?;

        let consul_address =
            env::var("MPC_CONSUL_ADDRESS").unwrap_or_else(|_| "http://127.0.0.1:8500".to_string());

        let log_level = env::var("MPC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("MPC_LOG_JSON").map(|v| v == "1").unwrap_or(false);

        Ok(Self {
            node_id,
            node_type,
            rpc_port,
            advertise_address,
            tls,
            supported_protocols,
            session_timeout: Duration::from_secs(timeout_secs),
            db_path,
            key_share_storage_path,
            key_share_encryption_key,
            consul_address,
            log_level,
            log_json,
        })
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.tls.is_none() {
            return Err(ConfigError::TlsIncomplete(
                "plaintext transport is not allowed in production".to_string(),
            ));
        }
        if self.key_share_encryption_key.len() < 16 {
            return Err(ConfigError::InvalidValue(
                "MPC_KEY_SHARE_ENCRYPTION_KEY".to_string(),
                "key must be at least 16 characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== keyquorum Configuration ===");
        println!("Node ID: {}", self.node_id);
        println!("Node Type: {}", self.node_type.as_str());
        println!("RPC Port: {}", self.rpc_port);
        println!("Advertise Address: {}", self.advertise_address);
        println!("TLS: {}", if self.tls.is_some() { "enabled (mutual)" } else { "disabled" });
        println!(
            "Protocols: {}",
            self.supported_protocols
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!("Session Timeout: {}s", self.session_timeout.as_secs());
        println!("Database: {}", self.db_path);
        println!("Key Share Path: {}", self.key_share_storage_path);
        println!("Consul: {}", self.consul_address);
        println!("Log Level: {}", self.log_level);
        println!("===============================");
    }
}

fn load_tls_config() -> Result<Option<TlsConfig>, ConfigError> {
    let enabled = env::var("MPC_TLS_ENABLED").map(|v| v == "1").unwrap_or(false);
    if !enabled {
        return Ok(None);
    }

    let cert_file = env::var("MPC_TLS_CERT_FILE")
        .map_err(|_| ConfigError::TlsIncomplete("MPC_TLS_CERT_FILE required".to_string()))?;
    let key_file = env::var("MPC_TLS_KEY_FILE")
        .map_err(|_| ConfigError::TlsIncomplete("MPC_TLS_KEY_FILE required".to_string()))?;
    let ca_cert_file = env::var("MPC_TLS_CA_CERT_FILE").ok();

    Ok(Some(TlsConfig {
        cert_file,
        key_file,
        ca_cert_file,
    }))
}

fn parse_protocols(raw: &str) -> Result<Vec<Protocol>, ConfigError> {
    let mut protocols = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let protocol: Protocol = part.parse().map_err(|_| {
            ConfigError::InvalidValue(
                "MPC_SUPPORTED_PROTOCOLS".to_string(),
                format!("unknown protocol: {}", part),
            )
        })?;
        if !protocols.contains(&protocol) {
            protocols.push(protocol);
        }
    }
    Ok(protocols)
}
