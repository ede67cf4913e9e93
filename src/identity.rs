//! Party Identity Mapping
//!
//! Maps node ids onto protocol party ids. The party key is the SHA-256 of
//! the node id interpreted as a big integer, so every node derives the same
//! mapping independently. Sorting is by node id; all participants must feed
//! the same sorted list in for the orderings to agree.

use std::collections::HashMap;

use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Identity of one party in a threshold protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyId {
    /// The node id; doubles as the routing address
    pub id: String,
    /// SHA-256 of the node id as a big unsigned integer
    pub key: BigUint,
}

impl PartyId {
    /// Deterministically derive the party id for a node
    pub fn from_node_id(node_id: &str) -> Self {
        let digest = Sha256::digest(node_id.as_bytes());
        Self {
            id: node_id.to_string(),
            key: BigUint::from_bytes_be(&digest),
        }
    }
}

/// Memoized two-way `nodeId ↔ PartyId` mapping for this node
///
/// Writers only at session start; readers on every message.
pub struct PartyRoster {
    inner: RwLock<RosterInner>,
}

#[derive(Default)]
struct RosterInner {
    by_node: HashMap<String, PartyId>,
    by_party: HashMap<String, String>,
}

impl PartyRoster {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RosterInner::default()),
        }
    }

    /// Register party ids for the given nodes; re-adding is a no-op
    pub async fn register(&self, node_ids: &[String]) {
        let mut inner = self.inner.write().await;
        for node_id in node_ids {
            if inner.by_node.contains_key(node_id) {
                continue;
            }
            let party_id = PartyId::from_node_id(node_id);
            inner.by_party.insert(party_id.id.clone(), node_id.clone());
            inner.by_node.insert(node_id.clone(), party_id);
        }
    }

    /// Party id for a node, if registered
    pub async fn party_id(&self, node_id: &str) -> Option<PartyId> {
        self.inner.read().await.by_node.get(node_id).cloned()
    }

    /// Node id behind a party id, if registered
    pub async fn node_id(&self, party_id: &str) -> Option<String> {
        self.inner.read().await.by_party.get(party_id).cloned()
    }

    /// Sorted party ids for a participant list
    ///
    /// Sorts by node id so every node derives a byte-identical ordering.
    /// Errors name the missing node and the available mapping, which is the
    /// information needed to diagnose a roster/session mismatch.
    pub async fn sorted_party_ids(&self, node_ids: &[String]) -> Result<Vec<PartyId>, String> {
        let inner = self.inner.read().await;
        let mut sorted: Vec<String> = node_ids.to_vec();
        sorted.sort();

        let mut parties = Vec::with_capacity(sorted.len());
        for node_id in &sorted {
            let party_id = inner.by_node.get(node_id).ok_or_else(|| {
                let mut available: Vec<&String> = inner.by_node.keys().collect();
                available.sort();
                format!(
                    "party ID not found for node {} (available: {:?}, requested: {:?})",
                    node_id, available, node_ids
                )
            })?;
            parties.push(party_id.clone());
        }
        Ok(parties)
    }
}

impl Default for PartyRoster {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort a participant list the way every component must: lexicographically
pub fn sort_node_ids(node_ids: &[String]) -> Vec<String> {
    let mut sorted = node_ids.to_vec();
    sorted.sort();
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<String> {
        vec!["n3".to_string(), "n1".to_string(), "n2".to_string()]
    }

    #[test]
    fn test_party_id_deterministic() {
        let a = PartyId::from_node_id("n1");
        let b = PartyId::from_node_id("n1");
        assert_eq!(a, b);
        assert_ne!(a, PartyId::from_node_id("n2"));
        assert!(a.key.bits() > 0);
    }

    #[tokio::test]
    async fn test_sorted_party_ids_identical_across_rosters() {
        // two independent rosters, differently ordered input
        let roster_a = PartyRoster::new();
        let roster_b = PartyRoster::new();
        roster_a.register(&nodes()).await;
        let mut reversed = nodes();
        reversed.reverse();
        roster_b.register(&reversed).await;

        let sorted_a = roster_a.sorted_party_ids(&nodes()).await.unwrap();
        let sorted_b = roster_b.sorted_party_ids(&reversed).await.unwrap();
        assert_eq!(sorted_a, sorted_b);
        assert_eq!(sorted_a[0].id, "n1");
        assert_eq!(sorted_a[2].id, "n3");
    }

    #[tokio::test]
    async fn test_reregister_is_noop() {
        let roster = PartyRoster::new();
        roster.register(&nodes()).await;
        let before = roster.party_id("n1").await.unwrap();
        roster.register(&nodes()).await;
        let after = roster.party_id("n1").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_unknown_node_error_names_roster() {
        let roster = PartyRoster::new();
        roster.register(&["n1".to_string()]).await;
        let err = roster
            .sorted_party_ids(&["n1".to_string(), "nX".to_string()])
            .await
            .unwrap_err();
        assert!(err.contains("nX"));
        assert!(err.contains("n1"));
    }

    #[tokio::test]
    async fn test_reverse_lookup() {
        let roster = PartyRoster::new();
        roster.register(&nodes()).await;
        let party = roster.party_id("n2").await.unwrap();
        assert_eq!(roster.node_id(&party.id).await.unwrap(), "n2");
        assert!(roster.node_id("unknown").await.is_none());
    }
}
