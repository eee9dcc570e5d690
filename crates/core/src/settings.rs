//! Environment-driven configuration, read once at startup.
//!
//! Optional keys stay `Option` and surface `ConfigMissing` through the
//! accessors only when a code path actually needs them, so a literal-endpoint
//! create works on a box with no swarm or subnet configured.

use crate::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Shared cluster endpoint used when a component asks for `baremetal`.
    pub swarm_host: Option<String>,
    /// CIDR the allocator hands addresses out of.
    pub subnet: Option<String>,
    pub bridge: String,
    pub gateway: String,
    /// Base URL of the network/log registration service.
    pub registration_url: Option<String>,
    pub dns_url: Option<String>,
    pub dns_access_key: Option<String>,
    pub dns_secret_key: Option<String>,
    /// Fallbacks when a component carries no `memory`/`cpu` attribute.
    pub default_memory_mb: u64,
    pub default_swap_mb: u64,
    pub default_cpu_units: u32,
    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            swarm_host: var("STEVEDORE_SWARM_HOST"),
            subnet: var("STEVEDORE_SUBNET"),
            bridge: var("STEVEDORE_BRIDGE").unwrap_or_else(|| "docker0".to_string()),
            gateway: var("STEVEDORE_GATEWAY").unwrap_or_default(),
            registration_url: var("STEVEDORE_REGISTRATION_URL"),
            dns_url: var("STEVEDORE_DNS_URL"),
            dns_access_key: var("STEVEDORE_DNS_ACCESS_KEY"),
            dns_secret_key: var("STEVEDORE_DNS_SECRET_KEY"),
            default_memory_mb: parsed("STEVEDORE_DEFAULT_MEMORY_MB", 512),
            default_swap_mb: parsed("STEVEDORE_DEFAULT_SWAP_MB", 0),
            default_cpu_units: parsed("STEVEDORE_DEFAULT_CPU_UNITS", 1),
            poll_interval_secs: parsed("STEVEDORE_POLL_INTERVAL_SECS", 18),
            poll_max_attempts: parsed("STEVEDORE_POLL_MAX_ATTEMPTS", 40),
        }
    }

    pub fn swarm_host(&self) -> ProvisionResult<&str> {
        self.swarm_host
            .as_deref()
            .ok_or_else(|| ProvisionError::ConfigMissing("swarm_host".to_string()))
    }

    pub fn subnet(&self) -> ProvisionResult<&str> {
        self.subnet
            .as_deref()
            .ok_or_else(|| ProvisionError::ConfigMissing("subnet".to_string()))
    }

    pub fn registration_url(&self) -> ProvisionResult<&str> {
        self.registration_url
            .as_deref()
            .ok_or_else(|| ProvisionError::ConfigMissing("registration_url".to_string()))
    }

    pub fn dns_url(&self) -> ProvisionResult<&str> {
        self.dns_url
            .as_deref()
            .ok_or_else(|| ProvisionError::ConfigMissing("dns_url".to_string()))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            swarm_host: None,
            subnet: None,
            bridge: "docker0".to_string(),
            gateway: String::new(),
            registration_url: None,
            dns_url: None,
            dns_access_key: None,
            dns_secret_key: None,
            default_memory_mb: 512,
            default_swap_mb: 0,
            default_cpu_units: 1,
            poll_interval_secs: 18,
            poll_max_attempts: 40,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_swarm_host_is_config_missing() {
        let s = Settings::default();
        match s.swarm_host() {
            Err(ProvisionError::ConfigMissing(k)) => assert_eq!(k, "swarm_host"),
            other => panic!("expected ConfigMissing, got {:?}", other),
        }
    }

    #[test]
    fn defaults_cover_quota_fallbacks() {
        let s = Settings::default();
        assert_eq!(s.default_memory_mb, 512);
        assert_eq!(s.default_cpu_units, 1);
        assert_eq!(s.poll_interval_secs, 18);
    }
}
