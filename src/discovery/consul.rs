//! Consul Registry Client
//!
//! Speaks the Consul agent HTTP API. Registrations carry a TCP health check
//! so dead nodes drop out of discovery on their own; a service critical for
//! one minute is deregistered automatically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Discovery, DiscoveryError, ServiceInfo};

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: &'a HashMap<String, String>,
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "TCP")]
    tcp: String,
    interval: &'static str,
    timeout: &'static str,
    deregister_critical_service_after: &'static str,
}

#[derive(Debug, Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

/// Consul client over the agent HTTP API
pub struct ConsulClient {
    base_url: String,
    http: reqwest::Client,
}

impl ConsulClient {
    pub fn new(address: impl Into<String>) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        Ok(Self {
            base_url: address.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl Discovery for ConsulClient {
    async fn register(&self, service: &ServiceInfo) -> Result<(), DiscoveryError> {
        let registration = AgentServiceRegistration {
            id: &service.id,
            name: &service.name,
            address: &service.address,
            port: service.port,
            tags: &service.tags,
            meta: &service.meta,
            check: AgentServiceCheck {
                tcp: format!("{}:{}", service.address, service.port),
                interval: "10s",
                timeout: "5s",
                deregister_critical_service_after: "1m",
            },
        };

        let response = self
            .http
            .put(format!("{}/v1/agent/service/register", self.base_url))
            .json(&registration)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Request(format!(
                "register returned {}",
                response.status()
            )));
        }

        info!(
            service_id = %service.id,
            service_name = %service.name,
            address = %service.address,
            port = service.port,
            tags = ?service.tags,
            "Service registered"
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), DiscoveryError> {
        let response = self
            .http
            .put(format!(
                "{}/v1/agent/service/deregister/{}",
                self.base_url, service_id
            ))
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        // A 404 means the service never registered or was already reaped by
        // the critical-check sweeper; not an error.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!(service_id, "Service not found in registry, skipping deregistration");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(DiscoveryError::Request(format!(
                "deregister returned {}",
                response.status()
            )));
        }

        info!(service_id, "Service deregistered");
        Ok(())
    }

    async fn discover(
        &self,
        service_name: &str,
        tags: &[String],
    ) -> Result<Vec<ServiceInfo>, DiscoveryError> {
        let mut request = self
            .http
            .get(format!(
                "{}/v1/health/service/{}",
                self.base_url, service_name
            ))
            .query(&[("passing", "true")]);
        for tag in tags {
            request = request.query(&[("tag", tag.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Request(format!(
                "discover returned {}",
                response.status()
            )));
        }

        let entries: Vec<HealthServiceEntry> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;

        let services: Vec<ServiceInfo> = entries
            .into_iter()
            .map(|entry| ServiceInfo {
                id: entry.service.id,
                name: entry.service.service,
                address: entry.service.address,
                port: entry.service.port,
                tags: entry.service.tags,
                meta: entry.service.meta,
            })
            .collect();

        debug!(
            service_name,
            tags = ?tags,
            found = services.len(),
            "Service discovery completed"
        );
        Ok(services)
    }
}
