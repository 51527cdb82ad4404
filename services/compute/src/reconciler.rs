//! Background drift correction.
//!
//! The reconciler periodically inspects the container behind every settled
//! instance (`RUNNING` or `STOPPED`) and rewrites the stored state to match
//! what the runtime reports:
//! - container missing: `ERROR`, handle dropped, never recreated
//! - container stopped but instance `RUNNING`: `STOPPED`
//! - container running but instance `STOPPED`: `RUNNING`
//!
//! Instances in transitional states belong to a lifecycle task that settles
//! them whether or not its caller is still waiting, so they are skipped, as
//! are `TERMINATED` and `ERROR` instances. The runtime is
//! inspected without holding the instance lock; a correction is only applied
//! if the record has not moved since it was read.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::instance::{InstanceKey, InstanceState};
use crate::runtime::{ContainerRuntime, ContainerStatus, RuntimeError};
use crate::state::{InstanceSlot, InstanceStore};

/// Message recorded when a container vanishes.
pub const MISSING_CONTAINER_MESSAGE: &str = "backing container disappeared";

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Counters from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Instances whose container was inspected.
    pub examined: usize,
    /// Instances moved between `RUNNING` and `STOPPED`.
    pub corrected: usize,
    /// Instances moved to `ERROR` because their container is gone.
    pub errored: usize,
    /// Instances whose inspection failed; retried next pass.
    pub failed: usize,
}

enum Outcome {
    Skipped,
    InSync,
    Corrected,
    Errored,
    Failed,
    Moved,
}

/// Reconciler for correcting instance drift.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<InstanceStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<InstanceStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
        }
    }

    /// Run the loop on its own task. Consumes the reconciler, so a given
    /// reconciler runs at most once.
    pub fn spawn(self) -> ReconcilerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        ReconcilerHandle { shutdown, task }
    }

    /// Run the reconciliation loop until shutdown.
    #[instrument(skip_all, name = "reconciler")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    let stats = self.pass(Some(&shutdown)).await;
                    if stats.corrected + stats.errored + stats.failed > 0 {
                        info!(
                            examined = stats.examined,
                            corrected = stats.corrected,
                            errored = stats.errored,
                            failed = stats.failed,
                            "Reconciliation pass complete"
                        );
                    } else {
                        debug!(examined = stats.examined, "No drift");
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    pub async fn tick(&self) -> ReconcileStats {
        self.pass(None).await
    }

    async fn pass(&self, shutdown: Option<&watch::Receiver<bool>>) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        for (key, slot) in self.store.slots().await {
            if stopping(shutdown) {
                debug!("Shutdown requested mid-pass");
                break;
            }

            match self.reconcile_instance(&key, &slot).await {
                Outcome::Skipped => continue,
                Outcome::InSync | Outcome::Moved => {}
                Outcome::Corrected => stats.corrected += 1,
                Outcome::Errored => stats.errored += 1,
                Outcome::Failed => stats.failed += 1,
            }
            stats.examined += 1;
        }

        stats
    }

    async fn reconcile_instance(&self, key: &InstanceKey, slot: &InstanceSlot) -> Outcome {
        let (recorded, revision, handle) = {
            let instance = slot.lock().await;
            if instance.state.is_terminal() || instance.state.is_transitional() {
                return Outcome::Skipped;
            }
            (instance.state, instance.revision, instance.container_handle.clone())
        };

        let observed = match &handle {
            None => ContainerStatus::Missing,
            Some(handle) => match self.runtime.inspect(handle).await {
                Ok(status) => status,
                Err(RuntimeError::NotFound(_)) => ContainerStatus::Missing,
                Err(e) => {
                    warn!(instance = %key, container = %handle, error = %e, "Failed to inspect container");
                    return Outcome::Failed;
                }
            },
        };

        let (next, message, outcome) = match (recorded, observed) {
            (_, ContainerStatus::Missing) => (
                InstanceState::Error,
                Some(MISSING_CONTAINER_MESSAGE.to_string()),
                Outcome::Errored,
            ),
            (InstanceState::Running, ContainerStatus::Stopped) => {
                (InstanceState::Stopped, None, Outcome::Corrected)
            }
            (InstanceState::Stopped, ContainerStatus::Running) => {
                (InstanceState::Running, None, Outcome::Corrected)
            }
            _ => return Outcome::InSync,
        };

        let mut instance = slot.lock().await;
        if instance.revision != revision {
            debug!(instance = %key, "Instance changed during inspection, leaving it");
            return Outcome::Moved;
        }

        warn!(
            instance = %key,
            recorded = %recorded,
            observed = ?observed,
            corrected_to = %next,
            "Drift detected"
        );
        if observed == ContainerStatus::Missing {
            instance.container_handle = None;
        }
        instance.transition(next, message);
        outcome
    }
}

fn stopping(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

/// Owner of a running reconciler task.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait up to `timeout` for the loop to exit,
    /// aborting it past that. Returns whether it exited on its own.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let mut task = self.task;

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Reconciler task failed");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Reconciler did not stop in time, aborting"
                );
                task.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::{AddressAllocator, AddressPlan};
    use crate::instance::InsertRequest;
    use crate::naming::SelfLinks;
    use crate::operations::OperationTracker;
    use crate::orchestrator::{container_name, InstanceOrchestrator, OrchestratorConfig};
    use crate::runtime::{MockRuntime, RuntimeCall};
    use std::collections::HashMap;

    struct Harness {
        runtime: Arc<MockRuntime>,
        orchestrator: InstanceOrchestrator,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(InstanceStore::new());
        let links = SelfLinks::default();
        let plan = AddressPlan {
            subnets: HashMap::new(),
            default_subnet: "10.128.0.0/24".parse().unwrap(),
            external_pools: HashMap::new(),
            default_external_pool: "203.0.113.0/24".parse().unwrap(),
        };
        let orchestrator = InstanceOrchestrator::new(
            runtime.clone(),
            store.clone(),
            Arc::new(OperationTracker::new(links.clone())),
            Arc::new(AddressAllocator::new(plan, links.clone())),
            links,
            OrchestratorConfig::default(),
        );
        let reconciler = Reconciler::new(
            runtime.clone(),
            store,
            ReconcilerConfig {
                interval: Duration::from_millis(10),
            },
        );
        Harness {
            runtime,
            orchestrator,
            reconciler,
        }
    }

    fn key(name: &str) -> InstanceKey {
        InstanceKey::new("p", "us-central1-a", name)
    }

    async fn insert(h: &Harness, name: &str) -> crate::runtime::ContainerHandle {
        h.orchestrator
            .insert(InsertRequest {
                project: "p".to_string(),
                zone: "us-central1-a".to_string(),
                name: name.to_string(),
                machine_type: "e2-small".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let view = h.orchestrator.get(&key(name)).await.unwrap();
        h.runtime
            .handle_by_name(&container_name(&view.instance_id))
            .await
            .unwrap()
    }

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_drift_is_noop() {
        let h = harness();
        insert(&h, "vm-1").await;
        let before = h.orchestrator.get(&key("vm-1")).await.unwrap();

        let stats = h.reconciler.tick().await;
        assert_eq!(
            stats,
            ReconcileStats {
                examined: 1,
                ..Default::default()
            }
        );
        assert_eq!(h.orchestrator.get(&key("vm-1")).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_stopped_container_corrects_to_stopped() {
        let h = harness();
        let handle = insert(&h, "vm-1").await;
        h.runtime.set_status(&handle, ContainerStatus::Stopped).await;

        let stats = h.reconciler.tick().await;
        assert_eq!(stats.corrected, 1);
        assert_eq!(
            h.orchestrator.get(&key("vm-1")).await.unwrap().status,
            InstanceState::Stopped
        );

        // and back again
        h.runtime.set_status(&handle, ContainerStatus::Running).await;
        h.reconciler.tick().await;
        assert_eq!(
            h.orchestrator.get(&key("vm-1")).await.unwrap().status,
            InstanceState::Running
        );
    }

    #[tokio::test]
    async fn test_missing_container_marks_error_once() {
        let h = harness();
        let handle = insert(&h, "vm-1").await;
        h.runtime.forget(&handle).await;

        let stats = h.reconciler.tick().await;
        assert_eq!(stats.errored, 1);
        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        assert_eq!(view.status, InstanceState::Error);
        assert_eq!(view.status_message.as_deref(), Some(MISSING_CONTAINER_MESSAGE));

        // ERROR is final: nothing left to examine
        assert_eq!(h.reconciler.tick().await, ReconcileStats::default());
    }

    #[tokio::test]
    async fn test_inspect_failure_does_not_block_others() {
        let h = harness();
        insert(&h, "vm-1").await;
        insert(&h, "vm-2").await;
        h.runtime.fail(RuntimeCall::Inspect).await;

        let stats = h.reconciler.tick().await;
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.failed, 2);
        for name in ["vm-1", "vm-2"] {
            assert_eq!(
                h.orchestrator.get(&key(name)).await.unwrap().status,
                InstanceState::Running
            );
        }
    }

    #[tokio::test]
    async fn test_terminated_instances_are_skipped() {
        let h = harness();
        insert(&h, "vm-1").await;
        h.orchestrator.terminate(&key("vm-1")).await.unwrap();

        assert_eq!(h.reconciler.tick().await.examined, 0);
    }

    #[tokio::test]
    async fn test_spawned_loop_corrects_and_shuts_down() {
        let h = harness();
        let handle = insert(&h, "vm-1").await;
        h.runtime.set_status(&handle, ContainerStatus::Stopped).await;

        let running = h.reconciler.spawn();
        for _ in 0..100 {
            if h.orchestrator.get(&key("vm-1")).await.unwrap().status == InstanceState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            h.orchestrator.get(&key("vm-1")).await.unwrap().status,
            InstanceState::Stopped
        );

        assert!(running.shutdown(Duration::from_secs(1)).await);
    }
}
