//! Network-attachment and log registration posts, plus DNS subdomain
//! publication. Every call here is at-most-once: upstream idempotency is
//! unconfirmed, so failures are reported as `Publish` errors and callers
//! log them without retrying.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Serialize;
use stevedore_core::{ProvisionError, ProvisionResult};
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub bridge: String,
    pub container_id: String,
    pub ip_addr: String,
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogRegistration {
    pub container_id: String,
    pub container_name: String,
}

/// Registration-service seam. Mocked in orchestrator tests.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_network(&self, container_id: &str, ip: &str) -> ProvisionResult<()>;
    async fn publish_logs(&self, container_id: &str, container_name: &str) -> ProvisionResult<()>;
}

/// Posts JSON documents to the registration service
/// (`{base}/docker/networks`, `{base}/docker/logs`).
pub struct HttpPublisher {
    base: String,
    bridge: String,
    gateway: String,
    http: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(base: impl Into<String>, bridge: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            bridge: bridge.into(),
            gateway: gateway.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), path)
    }

    async fn post<T: Serialize + Sync>(&self, url: &str, payload: &T) -> ProvisionResult<()> {
        let resp = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ProvisionError::Publish(format!("POST {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProvisionError::Publish(format!("POST {url}: status {status}")));
        }
        info!(url = %url, status = %status, "registration posted");
        Ok(())
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish_network(&self, container_id: &str, ip: &str) -> ProvisionResult<()> {
        let payload = NetworkAttachment {
            bridge: self.bridge.clone(),
            container_id: container_id.to_string(),
            ip_addr: ip.to_string(),
            gateway: self.gateway.clone(),
        };
        self.post(&self.url("docker/networks"), &payload).await
    }

    async fn publish_logs(&self, container_id: &str, container_name: &str) -> ProvisionResult<()> {
        let payload = LogRegistration {
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
        };
        self.post(&self.url("docker/logs"), &payload).await
    }
}

/// DNS subdomain registration seam.
#[async_trait]
pub trait DnsRegistrar: Send + Sync {
    async fn register(&self, subdomain: &str, domain: &str, ip: &str) -> ProvisionResult<()>;
}

/// Posts subdomain records to the DNS registration service along with the
/// account credentials it expects.
pub struct HttpDnsRegistrar {
    service_url: String,
    access_key: String,
    secret_key: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubdomainRecord<'a> {
    access_key: &'a str,
    secret_key: &'a str,
    domain: &'a str,
    subdomain: &'a str,
    ip: &'a str,
}

impl HttpDnsRegistrar {
    pub fn new(
        service_url: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            service_url: service_url.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DnsRegistrar for HttpDnsRegistrar {
    async fn register(&self, subdomain: &str, domain: &str, ip: &str) -> ProvisionResult<()> {
        let record = SubdomainRecord {
            access_key: &self.access_key,
            secret_key: &self.secret_key,
            domain,
            subdomain,
            ip,
        };
        let resp = self
            .http
            .post(&self.service_url)
            .json(&record)
            .send()
            .await
            .map_err(|e| ProvisionError::Publish(format!("dns register: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProvisionError::Publish(format!("dns register: status {status}")));
        }
        info!(subdomain = %subdomain, domain = %domain, ip = %ip, "subdomain registered");
        Ok(())
    }
}

/// Split a fully qualified container name `sub.domain.tld` into the
/// subdomain label and the dotted zone (`domain.tld.`).
pub fn split_hostname(fqn: &str) -> ProvisionResult<(String, String)> {
    let parts: Vec<&str> = fqn.split('.').collect();
    if parts.len() < 3 {
        return Err(ProvisionError::Publish(format!(
            "hostname {fqn} is not of the form sub.domain.tld"
        )));
    }
    Ok((parts[0].to_string(), format!("{}.{}.", parts[1], parts[2])))
}

/// Register a container's DNS name for an address that may not be serving
/// yet: this runs right after allocation, before readiness is known. That
/// window is accepted, not a bug.
pub async fn register_hostname(
    registrar: &dyn DnsRegistrar,
    fqn: &str,
    ip: &str,
) -> ProvisionResult<()> {
    let (subdomain, domain) = split_hostname(fqn)?;
    registrar.register(&subdomain, &domain, ip).await
}
