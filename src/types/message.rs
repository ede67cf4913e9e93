//! Protocol Message Types
//!
//! Frames queued between the transport and a local Party.

/// One inbound protocol frame awaiting injection into a Party
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from_node_id: String,
    pub payload: Vec<u8>,
    pub is_broadcast: bool,
}

/// Node liveness record cached from discovery and heartbeats
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_seen: u64,
}

/// Liveness status of a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NodeStatus {
    Active,
    Inactive,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "Active",
            NodeStatus::Inactive => "Inactive",
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(NodeStatus::Active),
            "Inactive" => Ok(NodeStatus::Inactive),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

/// Persisted round progress for crash recovery
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoundProgress {
    pub session_id: String,
    pub protocol: String,
    pub round: u32,
    pub payload: Vec<u8>,
    pub updated_at: u64,
}

/// One append-only WAL record for an in-flight session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WalRecord {
    pub session_id: String,
    /// Sequence assigned by the store on append; 0 before persistence
    pub seq: u64,
    pub kind: String,
    pub payload: Vec<u8>,
    pub created_at: u64,
}
