//! Service Discovery
//!
//! Registry abstraction over cluster membership. The node type is encoded as
//! a `node-type:<value>` tag so one service name can cover coordinators and
//! participants.

pub mod consul;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

pub use consul::ConsulClient;

/// Tag prefix carrying the node type
pub const NODE_TYPE_TAG: &str = "node-type";

/// Service name all MPC nodes register under
pub const MPC_SERVICE_NAME: &str = "keyquorum-mpc";

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("registry request failed: {0}")]
    Request(String),

    #[error("registry returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// One registered service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

impl ServiceInfo {
    /// Build the standard registration record for an MPC node
    pub fn for_node(node_id: &str, node_type: &str, address: &str, port: u16) -> Self {
        Self {
            id: node_id.to_string(),
            name: MPC_SERVICE_NAME.to_string(),
            address: address.to_string(),
            port,
            tags: vec![format!("{}:{}", NODE_TYPE_TAG, node_type)],
            meta: HashMap::new(),
        }
    }

    /// Node type extracted from the tags
    pub fn node_type(&self) -> Option<&str> {
        self.tags.iter().find_map(|tag| {
            tag.strip_prefix(NODE_TYPE_TAG)
                .and_then(|rest| rest.strip_prefix(':'))
        })
    }

    /// Tag that selects services of one node type
    pub fn node_type_tag(node_type: &str) -> String {
        format!("{}:{}", NODE_TYPE_TAG, node_type)
    }
}

/// Service registry interface
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Register this node with a liveness check
    async fn register(&self, service: &ServiceInfo) -> Result<(), DiscoveryError>;

    /// Remove a registration; unknown ids are tolerated
    async fn deregister(&self, service_id: &str) -> Result<(), DiscoveryError>;

    /// Healthy services under a name, optionally filtered by tags
    async fn discover(
        &self,
        service_name: &str,
        tags: &[String],
    ) -> Result<Vec<ServiceInfo>, DiscoveryError>;
}

/// Fixed in-process registry for tests and single-host development
pub struct StaticDiscovery {
    services: RwLock<Vec<ServiceInfo>>,
}

impl StaticDiscovery {
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self {
            services: RwLock::new(services),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn register(&self, service: &ServiceInfo) -> Result<(), DiscoveryError> {
        let mut services = self.services.write().await;
        services.retain(|s| s.id != service.id);
        services.push(service.clone());
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), DiscoveryError> {
        self.services.write().await.retain(|s| s.id != service_id);
        Ok(())
    }

    async fn discover(
        &self,
        service_name: &str,
        tags: &[String],
    ) -> Result<Vec<ServiceInfo>, DiscoveryError> {
        Ok(self
            .services
            .read()
            .await
            .iter()
            .filter(|s| s.name == service_name)
            .filter(|s| tags.iter().all(|tag| s.tags.contains(tag)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_tag_extraction() {
        let service = ServiceInfo::for_node("n1", "participant", "10.0.0.1", 9000);
        assert_eq!(service.node_type(), Some("participant"));
        assert_eq!(service.name, MPC_SERVICE_NAME);

        let untagged = ServiceInfo {
            tags: vec!["other".into()],
            ..service
        };
        assert_eq!(untagged.node_type(), None);
    }

    #[tokio::test]
    async fn test_static_discovery_filters_by_tag() {
        let discovery = StaticDiscovery::new(vec![
            ServiceInfo::for_node("n1", "participant", "10.0.0.1", 9000),
            ServiceInfo::for_node("n2", "participant", "10.0.0.2", 9000),
            ServiceInfo::for_node("c1", "coordinator", "10.0.0.9", 9000),
        ]);

        let participants = discovery
            .discover(
                MPC_SERVICE_NAME,
                &[ServiceInfo::node_type_tag("participant")],
            )
            .await
            .unwrap();
        assert_eq!(participants.len(), 2);

        let all = discovery.discover(MPC_SERVICE_NAME, &[]).await.unwrap();
        assert_eq!(all.len(), 3);

        discovery.deregister("n1").await.unwrap();
        let all = discovery.discover(MPC_SERVICE_NAME, &[]).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
