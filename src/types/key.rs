//! Threshold Key Metadata
//!
//! Cluster-wide record of a threshold key. Created as a Pending placeholder
//! by the coordinator before DKG runs, promoted to Active exactly once when
//! DKG publishes the public key, soft-deleted at end of life.

use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::common::now_secs;

/// Placeholder value carried in `public_key` until DKG completes
pub const PENDING_PUBLIC_KEY: &str = "pending";

/// Signature algorithm of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "ECDSA")]
    Ecdsa,
    #[serde(rename = "EdDSA")]
    Eddsa,
    #[serde(rename = "Schnorr")]
    Schnorr,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Ecdsa => "ECDSA",
            Algorithm::Eddsa => "EdDSA",
            Algorithm::Schnorr => "Schnorr",
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ecdsa" => Ok(Algorithm::Ecdsa),
            "eddsa" => Ok(Algorithm::Eddsa),
            "schnorr" => Ok(Algorithm::Schnorr),
            other => Err(format!("unknown algorithm: {}", other)),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Elliptic curve of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Curve {
    #[serde(rename = "secp256k1")]
    Secp256k1,
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl Curve {
    pub fn as_str(&self) -> &'static str {
        match self {
            Curve::Secp256k1 => "secp256k1",
            Curve::Ed25519 => "ed25519",
        }
    }
}

impl FromStr for Curve {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "secp256k1" => Ok(Curve::Secp256k1),
            "ed25519" => Ok(Curve::Ed25519),
            other => Err(format!("unknown curve: {}", other)),
        }
    }
}

impl std::fmt::Display for Curve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    Pending,
    Active,
    Deleted,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "Pending",
            KeyStatus::Active => "Active",
            KeyStatus::Deleted => "Deleted",
        }
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(KeyStatus::Pending),
            "Active" => Ok(KeyStatus::Active),
            "Deleted" => Ok(KeyStatus::Deleted),
            other => Err(format!("unknown key status: {}", other)),
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-wide record of a threshold key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    /// Compressed public key, hex; [`PENDING_PUBLIC_KEY`] until DKG completes
    pub public_key: String,
    pub algorithm: Algorithm,
    pub curve: Curve,
    pub threshold: usize,
    pub total_nodes: usize,
    pub chain_type: Option<String>,
    /// Chain address derived from the public key, when requested
    pub address: Option<String>,
    pub status: KeyStatus,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub deleted_at: Option<u64>,
}

impl KeyMetadata {
    /// New Pending placeholder, created before the DKG session
    pub fn placeholder(
        key_id: impl Into<String>,
        algorithm: Algorithm,
        curve: Curve,
        threshold: usize,
        total_nodes: usize,
    ) -> Self {
        let now = now_secs();
        Self {
            key_id: key_id.into(),
            public_key: PENDING_PUBLIC_KEY.to_string(),
            algorithm,
            curve,
            threshold,
            total_nodes,
            chain_type: None,
            address: None,
            status: KeyStatus::Pending,
            description: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Validate the threshold parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.threshold < 2 {
            return Err("threshold must be at least 2".to_string());
        }
        if self.total_nodes < self.threshold {
            return Err("total nodes must be at least threshold".to_string());
        }
        Ok(())
    }
}
