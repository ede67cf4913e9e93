//! Key Service
//!
//! Manages the lifecycle of KeyMetadata rows: Pending placeholders created
//! ahead of DKG, reads, listings, soft deletes, and the chain-address leaf
//! adapter hook. Promotion to Active happens in the session manager when
//! DKG publishes the public key.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::common::{now_secs, MpcError, Result};
use crate::storage::traits::{KeyFilter, KeyStore};
use crate::types::key::{Algorithm, Curve, KeyMetadata, KeyStatus};

/// Derives a chain-specific address from a public key
///
/// Chain adapters are leaf collaborators; the service only stores what they
/// return.
pub trait ChainAdapter: Send + Sync {
    fn derive_address(&self, public_key: &[u8]) -> Result<String>;
}

/// Request to create a key placeholder
#[derive(Debug, Clone)]
pub struct CreateKeyRequest {
    /// Explicit id; generated when absent
    pub key_id: Option<String>,
    pub algorithm: Algorithm,
    pub curve: Curve,
    pub threshold: usize,
    pub total_nodes: usize,
    pub chain_type: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// Key metadata service
pub struct KeyService {
    store: Arc<dyn KeyStore>,
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
}

impl KeyService {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            adapters: HashMap::new(),
        }
    }

    /// Register a chain adapter for address derivation
    pub fn with_adapter(mut self, chain_type: impl Into<String>, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.adapters.insert(chain_type.into(), adapter);
        self
    }

    /// Create a Pending placeholder ahead of DKG and verify it by re-read
    pub async fn create_placeholder(&self, req: &CreateKeyRequest) -> Result<KeyMetadata> {
        let key_id = req
            .key_id
            .clone()
            .unwrap_or_else(|| format!("key-{}", Uuid::new_v4()));

        let mut key = KeyMetadata::placeholder(
            &key_id,
            req.algorithm,
            req.curve,
            req.threshold,
            req.total_nodes,
        );
        key.chain_type = req.chain_type.clone();
        key.description = req.description.clone();
        key.tags = req.tags.clone();
        key.validate().map_err(MpcError::InvalidRequest)?;

        self.store.save_key(&key).await?;

        let saved = self
            .store
            .get_key(&key_id)
            .await?
            .ok_or_else(|| MpcError::internal("key saved but verification read came back empty"))?;

        info!(
            key_id = %saved.key_id,
            algorithm = %saved.algorithm,
            curve = %saved.curve,
            threshold = saved.threshold,
            total_nodes = saved.total_nodes,
            status = %saved.status,
            "Placeholder key created"
        );

        Ok(saved)
    }

    /// Ensure a placeholder exists for the given id, creating one if needed
    pub async fn ensure_placeholder(
        &self,
        key_id: &str,
        algorithm: Algorithm,
        curve: Curve,
        threshold: usize,
        total_nodes: usize,
    ) -> Result<KeyMetadata> {
        if let Some(existing) = self.store.get_key(key_id).await? {
            if existing.status == KeyStatus::Deleted {
                return Err(MpcError::invalid(format!("key {} is deleted", key_id)));
            }
            return Ok(existing);
        }

        self.create_placeholder(&CreateKeyRequest {
            key_id: Some(key_id.to_string()),
            algorithm,
            curve,
            threshold,
            total_nodes,
            chain_type: None,
            description: None,
            tags: Vec::new(),
        })
        .await
    }

    /// Get a key by id
    pub async fn get_key(&self, key_id: &str) -> Result<KeyMetadata> {
        self.store
            .get_key(key_id)
            .await?
            .ok_or_else(|| MpcError::KeyNotFound(key_id.to_string()))
    }

    /// List keys matching a filter
    pub async fn list_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyMetadata>> {
        Ok(self.store.list_keys(filter).await?)
    }

    /// Soft-delete a key
    pub async fn delete_key(&self, key_id: &str) -> Result<()> {
        let mut key = self.get_key(key_id).await?;
        if key.status == KeyStatus::Deleted {
            return Ok(());
        }

        let now = now_secs();
        key.status = KeyStatus::Deleted;
        key.deleted_at = Some(now);
        key.updated_at = now;
        self.store.update_key(&key).await?;

        info!(key_id, "Key soft-deleted");
        Ok(())
    }

    /// Derive and persist a chain address for an Active key
    pub async fn generate_address(&self, key_id: &str, chain_type: &str) -> Result<String> {
        let mut key = self.get_key(key_id).await?;
        if key.status != KeyStatus::Active {
            return Err(MpcError::invalid(format!(
                "key {} is not Active (status: {})",
                key_id, key.status
            )));
        }

        let adapter = self
            .adapters
            .get(chain_type)
            .ok_or_else(|| MpcError::invalid(format!("unsupported chain type: {}", chain_type)))?;

        let public_key = hex::decode(&key.public_key)
            .map_err(|e| MpcError::internal(format!("stored public key is not hex: {}", e)))?;
        let address = adapter.derive_address(&public_key)?;

        key.chain_type = Some(chain_type.to_string());
        key.address = Some(address.clone());
        key.updated_at = now_secs();
        self.store.update_key(&key).await?;

        info!(key_id, chain_type, address = %address, "Chain address derived");
        Ok(address)
    }
}
