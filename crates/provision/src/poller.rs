//! Readiness detection: a spawned task that re-inspects a created container
//! until the runtime reports it running, then fires the registration side
//! effects exactly once and persists the component's runtime facts.
//!
//! The loop is deliberately best-effort: inspect failures are logged and
//! treated as "not running yet", publish and persistence failures are logged
//! and never escalated to the caller that launched the create.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use stevedore_core::{Component, KeyValuePair, PairList, Settings};
use stevedore_publish::Publisher;
use stevedore_runtime::ContainerRuntime;
use stevedore_store::{collections, Store};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Terminal states of the readiness loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            interval: Duration::from_secs(s.poll_interval_secs),
            max_attempts: s.poll_max_attempts.max(1),
        }
    }
}

/// Handle the orchestrator hands back to its caller. Waiting is optional;
/// dropping the handle leaves the poller running to completion.
#[derive(Debug)]
pub struct ReadinessHandle {
    rx: oneshot::Receiver<PollOutcome>,
    task: JoinHandle<()>,
}

impl ReadinessHandle {
    /// Await the terminal outcome. `None` means the poller was cancelled.
    pub async fn wait(self) -> Option<PollOutcome> {
        self.rx.await.ok()
    }

    /// Abort an orphaned poller, e.g. on shutdown.
    pub fn cancel(self) {
        self.task.abort();
    }
}

pub(crate) struct PollTarget {
    pub endpoint: String,
    pub container_id: String,
    pub container_name: String,
    pub ip: String,
    pub component: Component,
}

/// The component record persisted on readiness: the outputs list is
/// replaced wholesale, not merged, so stale keys cannot linger.
fn output_record(component: &Component, ip: &str, id: &str, endpoint: &str) -> Component {
    let outputs: PairList = [
        KeyValuePair::new("ip", ip),
        KeyValuePair::new("id", id),
        KeyValuePair::new("port", ""),
        KeyValuePair::new("endpoint", endpoint),
    ]
    .into_iter()
    .collect();
    Component { outputs, ..component.clone() }
}

pub(crate) fn spawn_poller(
    runtime: Arc<dyn ContainerRuntime>,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn Store>,
    cfg: PollConfig,
    target: PollTarget,
) -> ReadinessHandle {
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            match runtime.inspect(&target.endpoint, &target.container_id).await {
                Ok(state) if state.is_running() => break PollOutcome::Ready,
                Ok(state) => {
                    debug!(id = %target.container_id, ?state, attempts, "not running yet")
                }
                Err(e) => {
                    warn!(id = %target.container_id, error = %e, attempts, "inspect failed; retrying")
                }
            }
            if attempts >= cfg.max_attempts {
                break PollOutcome::TimedOut;
            }
            tokio::time::sleep(cfg.interval).await;
        };

        match outcome {
            PollOutcome::Ready => {
                info!(id = %target.container_id, ip = %target.ip, attempts, "container running");
                if let Err(e) = publisher.publish_network(&target.container_id, &target.ip).await {
                    warn!(id = %target.container_id, error = %e, "network registration failed");
                }
                if let Err(e) =
                    publisher.publish_logs(&target.container_id, &target.container_name).await
                {
                    warn!(id = %target.container_id, error = %e, "log registration failed");
                }
                let record = output_record(
                    &target.component,
                    &target.ip,
                    &target.container_id,
                    &target.endpoint,
                );
                if let Err(e) =
                    stevedore_store::save(store.as_ref(), collections::COMPONENTS, &record.id, &record)
                {
                    warn!(component = %record.id, error = %e, "component record update failed");
                } else {
                    info!(component = %record.id, "component record updated");
                }
                counter!("poller_ready_total", 1u64);
            }
            PollOutcome::TimedOut => {
                warn!(id = %target.container_id, attempts, "readiness deadline exhausted; nothing published");
                counter!("poller_timeout_total", 1u64);
            }
        }
        let _ = tx.send(outcome);
    });
    ReadinessHandle { rx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::lookup;

    #[test]
    fn output_record_replaces_not_merges() {
        let mut component = Component { id: "c1".into(), name: "web".into(), ..Default::default() };
        component.outputs.push(KeyValuePair::new("memory", "512"));
        component.outputs.push(KeyValuePair::new("stale", "yes"));

        let rec = output_record(&component, "10.0.0.4", "abc", "tcp://swarm:2375");
        let keys: Vec<&str> = rec.outputs.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["ip", "id", "port", "endpoint"]);
        assert_eq!(lookup(&rec.outputs, "ip"), Some("10.0.0.4"));
        assert_eq!(lookup(&rec.outputs, "port"), Some(""));
        assert_eq!(lookup(&rec.outputs, "stale"), None);
        assert_eq!(lookup(&rec.outputs, "memory"), None);
        // inputs and identity carry through untouched
        assert_eq!(rec.id, "c1");
        assert_eq!(rec.name, "web");
    }
}
