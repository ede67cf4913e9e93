//! Protocol Variants and Registry
//!
//! GG18, GG20 and FROST share one orchestration engine and differ only in
//! these options: the inner party primitives (ECDSA vs EdDSA), the round
//! timeouts, and whether a failed run identifies the misbehaving party.

use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::key::{Algorithm, Curve};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown protocol: {0}")]
    Unknown(String),

    #[error("protocol {0} is not enabled on this node")]
    NotSupported(String),
}

/// Supported threshold protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Gg18,
    Gg20,
    Frost,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Gg18 => "gg18",
            Protocol::Gg20 => "gg20",
            Protocol::Frost => "frost",
        }
    }

    /// Signature algorithm this protocol produces
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Protocol::Gg18 | Protocol::Gg20 => Algorithm::Ecdsa,
            Protocol::Frost => Algorithm::Eddsa,
        }
    }

    /// Curve this protocol runs on
    pub fn curve(&self) -> Curve {
        match self {
            Protocol::Gg18 | Protocol::Gg20 => Curve::Secp256k1,
            Protocol::Frost => Curve::Ed25519,
        }
    }

    /// Per-variant execution options
    pub fn options(&self) -> ProtocolOptions {
        match self {
            Protocol::Gg18 => ProtocolOptions {
                protocol: *self,
                keygen_timeout: Duration::from_secs(600),
                signing_timeout: Duration::from_secs(120),
                identifiable_abort: false,
                keygen_rounds: 4,
                signing_rounds: 9,
            },
            Protocol::Gg20 => ProtocolOptions {
                protocol: *self,
                keygen_timeout: Duration::from_secs(600),
                signing_timeout: Duration::from_secs(60),
                identifiable_abort: true,
                keygen_rounds: 4,
                signing_rounds: 7,
            },
            Protocol::Frost => ProtocolOptions {
                protocol: *self,
                keygen_timeout: Duration::from_secs(300),
                signing_timeout: Duration::from_secs(60),
                identifiable_abort: false,
                keygen_rounds: 2,
                signing_rounds: 2,
            },
        }
    }
}

impl FromStr for Protocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gg18" => Ok(Protocol::Gg18),
            "gg20" => Ok(Protocol::Gg20),
            "frost" => Ok(Protocol::Frost),
            other => Err(ProtocolError::Unknown(other.to_string())),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution options for one protocol variant
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    pub protocol: Protocol,
    pub keygen_timeout: Duration,
    pub signing_timeout: Duration,
    /// GG20 names culprits when a run aborts
    pub identifiable_abort: bool,
    pub keygen_rounds: u32,
    pub signing_rounds: u32,
}

/// Registry of the protocols enabled on this node
///
/// Options can be tuned per deployment; defaults come from
/// [`Protocol::options`].
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    supported: Vec<Protocol>,
    default: Protocol,
    overrides: Vec<ProtocolOptions>,
}

impl ProtocolRegistry {
    /// Build a registry from the configured protocol list; the first entry
    /// is the default.
    pub fn new(supported: Vec<Protocol>) -> Result<Self, ProtocolError> {
        let default = *supported
            .first()
            .ok_or_else(|| ProtocolError::Unknown("empty protocol list".to_string()))?;
        Ok(Self {
            supported,
            default,
            overrides: Vec::new(),
        })
    }

    /// Registry with all protocols enabled, GG18 default
    pub fn all() -> Self {
        Self {
            supported: vec![Protocol::Gg18, Protocol::Gg20, Protocol::Frost],
            default: Protocol::Gg18,
            overrides: Vec::new(),
        }
    }

    /// Replace the options for one protocol (deployment tuning)
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.overrides.retain(|o| o.protocol != options.protocol);
        self.overrides.push(options);
        self
    }

    pub fn default_protocol(&self) -> Protocol {
        self.default
    }

    pub fn supported(&self) -> &[Protocol] {
        &self.supported
    }

    /// Reject protocols absent from the configured set
    pub fn ensure_supported(&self, protocol: Protocol) -> Result<(), ProtocolError> {
        if self.supported.contains(&protocol) {
            Ok(())
        } else {
            Err(ProtocolError::NotSupported(protocol.as_str().to_string()))
        }
    }

    /// Effective options for a protocol, with deployment overrides applied
    pub fn options(&self, protocol: Protocol) -> ProtocolOptions {
        self.overrides
            .iter()
            .find(|o| o.protocol == protocol)
            .cloned()
            .unwrap_or_else(|| protocol.options())
    }
}
