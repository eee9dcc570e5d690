//! Stevedore core types: the assembly data model, the error taxonomy and
//! the environment-driven settings surface shared by every crate.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod settings;

pub use settings::Settings;

/// Sentinel `endpoint` input value meaning "use the shared swarm host from
/// configuration" rather than a literal runtime address.
pub const BAREMETAL: &str = "baremetal";

/// Fixed key under which the single allocation cursor is persisted.
pub const IP_INDEX_KEY: &str = "ipindex";

/// One input or output attribute of an assembly/component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Attribute lists are small in practice; keep them inline.
pub type PairList = SmallVec<[KeyValuePair; 8]>;

/// Linear lookup by key. Missing keys are recoverable; use [`require`] where
/// the value is fatal to the operation.
pub fn lookup<'a>(pairs: &'a [KeyValuePair], key: &str) -> Option<&'a str> {
    pairs.iter().find(|p| p.key == key).map(|p| p.value.as_str())
}

/// Lookup that surfaces `InputMissing` for a key the caller cannot proceed
/// without.
pub fn require<'a>(pairs: &'a [KeyValuePair], key: &str) -> ProvisionResult<&'a str> {
    lookup(pairs, key).ok_or_else(|| ProvisionError::InputMissing(key.to_string()))
}

/// One deployable element within an assembly. The core reads inputs and
/// rewrites outputs; everything else is carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Component {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tosca_type: String,
    #[serde(default)]
    pub inputs: PairList,
    #[serde(default)]
    pub outputs: PairList,
    #[serde(default)]
    pub artifacts: Option<serde_json::Value>,
    #[serde(default)]
    pub related_components: Vec<String>,
    #[serde(default)]
    pub operations: Option<serde_json::Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
}

/// A deployable unit composed of components. Owned by the caller; the core
/// only ever touches `components[0]` (single container per assembly).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Assembly {
    pub name: String,
    #[serde(default)]
    pub inputs: PairList,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Assembly {
    /// The one component this core operates on.
    pub fn head(&self) -> ProvisionResult<&Component> {
        self.components
            .first()
            .ok_or_else(|| ProvisionError::InputMissing("components".to_string()))
    }
}

/// Persisted allocation cursor, a singleton under [`IP_INDEX_KEY`].
/// `index` is monotonically non-decreasing for the lifetime of the subnet;
/// positions are never reclaimed, even after the container is deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpIndex {
    pub ip: String,
    pub subnet: String,
    pub index: u64,
}

/// Cloud account credentials fetched from the `cloud-access-keys`
/// collection. Consumed by the DNS registration path.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessKeys {
    pub access_key: String,
    pub secret_key: String,
}

/// Error taxonomy for the provisioning core. The synchronous create/delete
/// path surfaces the first fatal error; the asynchronous poller and
/// publisher log and never escalate.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ProvisionError {
    #[error("config missing: {0}")]
    ConfigMissing(String),
    #[error("input missing: {0}")]
    InputMissing(String),
    #[error("allocation read: {0}")]
    AllocationRead(String),
    #[error("subnet exhausted: {subnet} cannot hold position {position}")]
    SubnetExhausted { subnet: String, position: u64 },
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("runtime operation failed: {0}")]
    RuntimeOperationFailed(String),
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("publish: {0}")]
    Publish(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(kv: &[(&str, &str)]) -> PairList {
        kv.iter().map(|(k, v)| KeyValuePair::new(*k, *v)).collect()
    }

    #[test]
    fn lookup_finds_first_match() {
        let p = pairs(&[("endpoint", "baremetal"), ("domain", "megam.co")]);
        assert_eq!(lookup(&p, "domain"), Some("megam.co"));
        assert_eq!(lookup(&p, "missing"), None);
    }

    #[test]
    fn require_reports_the_missing_key() {
        let p = pairs(&[("endpoint", "baremetal")]);
        match require(&p, "source") {
            Err(ProvisionError::InputMissing(k)) => assert_eq!(k, "source"),
            other => panic!("expected InputMissing, got {:?}", other),
        }
    }

    #[test]
    fn head_on_empty_assembly_is_input_missing() {
        let a = Assembly { name: "app".into(), ..Default::default() };
        assert!(matches!(a.head(), Err(ProvisionError::InputMissing(_))));
    }

    #[test]
    fn component_roundtrips_with_defaults() {
        let raw = r#"{"id":"c1","name":"web","inputs":[{"key":"cpu","value":"2"}]}"#;
        let c: Component = serde_json::from_str(raw).unwrap();
        assert_eq!(c.name, "web");
        assert_eq!(lookup(&c.inputs, "cpu"), Some("2"));
        assert!(c.outputs.is_empty());
    }
}
