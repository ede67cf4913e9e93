//! DKG and Signing Sessions
//!
//! A session is the cluster-wide record of one DKG or signing attempt. DKG
//! sessions reuse the key id as session id; signing sessions get a fresh id.
//! The protocol tag is a typed enum rather than a free-form string so the
//! DKG-vs-signing classification cannot drift between call sites.

use serde::{Deserialize, Serialize};

use crate::common::{now_millis, now_secs};
use crate::protocol::Protocol;

/// Session lifecycle status; Completed/Cancelled/Timeout are sticky
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "Pending",
            SessionStatus::Active => "Active",
            SessionStatus::Completed => "Completed",
            SessionStatus::Cancelled => "Cancelled",
            SessionStatus::Timeout => "Timeout",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Timeout
        )
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(SessionStatus::Pending),
            "Active" => Ok(SessionStatus::Active),
            "Completed" => Ok(SessionStatus::Completed),
            "Cancelled" => Ok(SessionStatus::Cancelled),
            "Timeout" => Ok(SessionStatus::Timeout),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session is doing: generating a key or producing a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Keygen,
    Signing,
}

/// Typed protocol tag of a session
///
/// The wire/storage representation stays string-compatible with the
/// classifier set (`keygen`, `dkg`, `gg18`, `gg20`, `frost` mean DKG;
/// anything else means signing), but in-process code only ever sees this
/// enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SessionProtocol {
    Keygen(Protocol),
    Signing(Protocol),
}

impl SessionProtocol {
    pub fn kind(&self) -> SessionKind {
        match self {
            SessionProtocol::Keygen(_) => SessionKind::Keygen,
            SessionProtocol::Signing(_) => SessionKind::Signing,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            SessionProtocol::Keygen(p) | SessionProtocol::Signing(p) => *p,
        }
    }

    /// Storage/wire tag
    pub fn tag(&self) -> String {
        match self {
            SessionProtocol::Keygen(p) => p.as_str().to_string(),
            SessionProtocol::Signing(p) => format!("{}-signing", p.as_str()),
        }
    }

    /// Parse a tag; bare `keygen`/`dkg`/`signing` fall back to GG18
    pub fn parse(tag: &str) -> Result<Self, String> {
        let lower = tag.to_lowercase();
        match lower.as_str() {
            "keygen" | "dkg" => return Ok(SessionProtocol::Keygen(Protocol::Gg18)),
            "signing" => return Ok(SessionProtocol::Signing(Protocol::Gg18)),
            _ => {}
        }
        if let Some(prefix) = lower.strip_suffix("-signing") {
            let protocol: Protocol = prefix
                .parse()
                .map_err(|_| format!("unknown protocol tag: {}", tag))?;
            return Ok(SessionProtocol::Signing(protocol));
        }
        let protocol: Protocol = lower
            .parse()
            .map_err(|_| format!("unknown protocol tag: {}", tag))?;
        Ok(SessionProtocol::Keygen(protocol))
    }
}

impl From<SessionProtocol> for String {
    fn from(value: SessionProtocol) -> Self {
        value.tag()
    }
}

impl TryFrom<String> for SessionProtocol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionProtocol::parse(&value)
    }
}

/// Cluster-wide record of a DKG or signing attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub key_id: String,
    pub protocol: SessionProtocol,
    pub status: SessionStatus,
    pub threshold: usize,
    pub total_nodes: usize,
    /// Sorted lexicographically; determines PartyId ordering and the leader
    pub participating_nodes: Vec<String>,
    pub current_round: u32,
    pub total_rounds: u32,
    /// Signature hex on completion; DKG sessions carry the public key here
    pub signature: Option<String>,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    pub duration_ms: Option<u64>,
    pub expires_at: u64,
}

impl Session {
    pub fn kind(&self) -> SessionKind {
        self.protocol.kind()
    }

    /// First entry of the sorted participant list
    pub fn leader(&self) -> Option<&str> {
        self.participating_nodes.first().map(|s| s.as_str())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }

    /// Move to a terminal status, stamping completion time and duration
    pub fn finish(&mut self, status: SessionStatus, payload: Option<String>) {
        self.status = status;
        self.signature = payload.or(self.signature.take());
        let now = now_secs();
        self.completed_at = Some(now);
        self.duration_ms = Some(now_millis().saturating_sub(self.created_at * 1000));
    }
}
