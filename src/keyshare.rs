//! Key-Share Vault
//!
//! Persists each node's secret share encrypted at rest, one file per
//! `(keyId, nodeId)` laid out as `<root>/<keyId>/<nodeId>.share`. Shares are
//! sealed with AES-256-GCM under a key derived from the vault secret and the
//! share's coordinates, and the clear-text header rides along as associated
//! data: a share file cannot be re-pointed at another key or node, and any
//! edit to the header fails decryption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// On-disk format version; bump when the header schema changes
const FORMAT_VERSION: u16 = 1;

/// Domain tag for vault key derivation
const KDF_CONTEXT: &[u8] = b"keyquorum.vault.aes256gcm";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Key-share vault errors
#[derive(Debug, Error)]
pub enum KeyShareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("share file format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("unsupported share format version {0}")]
    UnsupportedVersion(u16),

    #[error("seal failed: {0}")]
    Seal(String),

    #[error("unseal failed: {0}")]
    Unseal(String),

    /// The file's header names different coordinates than the caller asked
    /// for, e.g. a share file copied between nodes
    #[error("share file does not belong to key {key_id} on node {node_id}")]
    WrongCoordinates { key_id: String, node_id: String },

    #[error("share not found for key {key_id} on node {node_id}")]
    NotFound { key_id: String, node_id: String },
}

/// Clear-text share header; doubles as the AEAD associated data
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShareHeader {
    key_id: String,
    node_id: String,
    share_index: u32,
    /// Group public key, hex; readable without unsealing
    public_key: String,
}

impl ShareHeader {
    /// Canonical length-prefixed encoding bound into the AEAD
    fn canonical_bytes(&self, version: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + 4 + self.key_id.len() + 4 + self.node_id.len() + 4 + self.public_key.len() + 4,
        );
        out.extend_from_slice(&version.to_be_bytes());
        for field in [
            self.key_id.as_bytes(),
            self.node_id.as_bytes(),
            self.public_key.as_bytes(),
        ] {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field);
        }
        out.extend_from_slice(&self.share_index.to_be_bytes());
        out
    }
}

/// On-disk envelope around one sealed share
#[derive(Debug, Serialize, Deserialize)]
struct ShareFile {
    version: u16,
    header: ShareHeader,
    /// KDF salt, hex
    salt: String,
    /// AES-GCM nonce, hex
    nonce: String,
    /// Sealed share bytes, hex
    sealed: String,
}

/// A decrypted share as the rest of the node sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeyShare {
    pub key_id: String,
    pub node_id: String,
    /// This node's secret share, left-padded to the scalar size
    pub share: Vec<u8>,
    /// Position in the sorted participant list, 1-based
    pub share_index: u32,
    /// Group public key, hex
    pub public_key: String,
}

/// Vault for encrypted key shares
pub struct KeyShareVault {
    root: PathBuf,
    secret: String,
}

impl KeyShareVault {
    pub fn new(root: impl AsRef<Path>, secret: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            secret: secret.into(),
        }
    }

    fn share_path(&self, key_id: &str, node_id: &str) -> PathBuf {
        self.root.join(key_id).join(format!("{}.share", node_id))
    }

    /// Per-share AES key: the hashed vault secret expanded over the share
    /// coordinates and salt, so no two shares seal under the same key even
    /// with a shared vault secret.
    fn share_key(&self, key_id: &str, node_id: &str, salt: &[u8]) -> [u8; 32] {
        let secret_digest = Sha256::digest(self.secret.as_bytes());

        let mut kdf = Sha256::new();
        kdf.update(KDF_CONTEXT);
        kdf.update(secret_digest);
        kdf.update((key_id.len() as u32).to_be_bytes());
        kdf.update(key_id.as_bytes());
        kdf.update((node_id.len() as u32).to_be_bytes());
        kdf.update(node_id.as_bytes());
        kdf.update(salt);
        kdf.finalize().into()
    }

    pub fn exists(&self, key_id: &str, node_id: &str) -> bool {
        self.share_path(key_id, node_id).exists()
    }

    /// Seal a share into the vault
    pub fn store(&self, share: &StoredKeyShare) -> Result<(), KeyShareError> {
        let header = ShareHeader {
            key_id: share.key_id.clone(),
            node_id: share.node_id.clone(),
            share_index: share.share_index,
            public_key: share.public_key.clone(),
        };

        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher =
            Aes256Gcm::new_from_slice(&self.share_key(&share.key_id, &share.node_id, &salt))
                .map_err(|e| KeyShareError::Seal(e.to_string()))?;
        let aad = header.canonical_bytes(FORMAT_VERSION);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &share.share,
                    aad: &aad,
                },
            )
            .map_err(|e| KeyShareError::Seal(e.to_string()))?;

        let file = ShareFile {
            version: FORMAT_VERSION,
            header,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            sealed: hex::encode(sealed),
        };

        let path = self.share_path(&share.key_id, &share.node_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&file)?)?;

        tracing::info!(
            key_id = %share.key_id,
            node_id = %share.node_id,
            share_index = share.share_index,
            "Key share sealed into vault"
        );

        Ok(())
    }

    fn read_file(&self, key_id: &str, node_id: &str) -> Result<ShareFile, KeyShareError> {
        let path = self.share_path(key_id, node_id);
        if !path.exists() {
            return Err(KeyShareError::NotFound {
                key_id: key_id.to_string(),
                node_id: node_id.to_string(),
            });
        }

        let file: ShareFile = serde_json::from_slice(&std::fs::read(&path)?)?;
        if file.version != FORMAT_VERSION {
            return Err(KeyShareError::UnsupportedVersion(file.version));
        }
        if file.header.key_id != key_id || file.header.node_id != node_id {
            return Err(KeyShareError::WrongCoordinates {
                key_id: key_id.to_string(),
                node_id: node_id.to_string(),
            });
        }
        Ok(file)
    }

    /// Unseal a share from the vault
    pub fn load(&self, key_id: &str, node_id: &str) -> Result<StoredKeyShare, KeyShareError> {
        let file = self.read_file(key_id, node_id)?;

        let salt = hex::decode(&file.salt).map_err(|e| KeyShareError::Unseal(e.to_string()))?;
        let nonce_bytes =
            hex::decode(&file.nonce).map_err(|e| KeyShareError::Unseal(e.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(KeyShareError::Unseal(format!(
                "nonce must be {} bytes, found {}",
                NONCE_LEN,
                nonce_bytes.len()
            )));
        }
        let sealed = hex::decode(&file.sealed).map_err(|e| KeyShareError::Unseal(e.to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&self.share_key(key_id, node_id, &salt))
            .map_err(|e| KeyShareError::Unseal(e.to_string()))?;
        let aad = file.header.canonical_bytes(file.version);
        let share = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                KeyShareError::Unseal("wrong vault secret or tampered share file".to_string())
            })?;

        Ok(StoredKeyShare {
            key_id: file.header.key_id,
            node_id: file.header.node_id,
            share,
            share_index: file.header.share_index,
            public_key: file.header.public_key,
        })
    }

    /// Group public key from the clear-text header, without unsealing
    pub fn public_key(&self, key_id: &str, node_id: &str) -> Result<String, KeyShareError> {
        Ok(self.read_file(key_id, node_id)?.header.public_key)
    }
}
