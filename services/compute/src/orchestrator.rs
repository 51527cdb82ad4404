//! Instance lifecycle orchestration.
//!
//! The orchestrator turns insert/start/stop/delete requests into container
//! runtime calls, address allocations and operation records. Each call:
//!
//! 1. validates the request and checks the instance's source state under the
//!    instance lock, failing synchronously without side effects
//! 2. moves the instance into a transitional state and opens an operation
//! 3. releases the lock and calls the runtime
//! 4. relocks, records the outcome on the instance unless delete took it over
//!    meanwhile, then completes the operation
//!
//! Steps 1 to 4 run on a spawned task, so they finish even if the caller is
//! dropped. Runtime failures leave the instance in `ERROR` and are recorded
//! on the operation. Nothing is retried.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stratus_id::{InstanceId, NumericId};
use tracing::{info, warn};

use crate::addresses::{AddressAllocator, PoolKey};
use crate::catalog::lookup_machine_type;
use crate::error::{ComputeError, ComputeResult, OperationError};
use crate::instance::{InsertRequest, Instance, InstanceKey, InstanceState, InstanceView};
use crate::naming::{region_of_zone, validate_name, validate_project, SelfLinks};
use crate::operations::{
    Operation, OperationKey, OperationKind, OperationScope, OperationTarget, OperationTracker,
};
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::state::{InstanceSlot, InstanceStore};

/// Label keys stamped on every container.
pub const LABEL_PROJECT: &str = "stratus.project";
pub const LABEL_ZONE: &str = "stratus.zone";
pub const LABEL_INSTANCE: &str = "stratus.instance";
pub const LABEL_INSTANCE_ID: &str = "stratus.instance-id";

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Image for inserts that do not name one.
    pub default_image: String,

    /// Grace period passed to the runtime on stop.
    pub stop_grace: Duration,

    /// Extra time allowed past the grace period before the stop is forced
    /// with a kill.
    pub stop_escalation: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_image: "debian:bookworm-slim".to_string(),
            stop_grace: Duration::from_secs(30),
            stop_escalation: Duration::from_secs(5),
        }
    }
}

/// Name of the container backing an instance.
pub fn container_name(id: &InstanceId) -> String {
    format!("stratus-{id}")
}

/// Owns the instance state machine.
///
/// Cloning shares the same core. Each lifecycle call runs on its own task
/// and the caller awaits it, so a caller that goes away never strands an
/// instance mid-transition: the call still settles the record and completes
/// its operation.
#[derive(Clone)]
pub struct InstanceOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<InstanceStore>,
    operations: Arc<OperationTracker>,
    addresses: Arc<AddressAllocator>,
    links: SelfLinks,
    config: OrchestratorConfig,
}

impl InstanceOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<InstanceStore>,
        operations: Arc<OperationTracker>,
        addresses: Arc<AddressAllocator>,
        links: SelfLinks,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                store,
                operations,
                addresses,
                links,
                config,
            }),
        }
    }

    pub fn operations(&self) -> &Arc<OperationTracker> {
        &self.inner.operations
    }

    pub fn addresses(&self) -> &Arc<AddressAllocator> {
        &self.inner.addresses
    }

    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.inner.store
    }

    pub async fn get(&self, key: &InstanceKey) -> ComputeResult<InstanceView> {
        let slot = self.inner.slot(key).await?;
        let instance = slot.lock().await;
        Ok(instance.view())
    }

    pub async fn list(&self, project: &str, zone: &str) -> Vec<InstanceView> {
        self.inner.store.list(project, zone).await
    }

    /// Create an instance and boot its container.
    pub async fn insert(&self, request: InsertRequest) -> ComputeResult<Operation> {
        let inner = Arc::clone(&self.inner);
        detach(async move { inner.insert(request).await }).await
    }

    /// Boot a stopped instance.
    pub async fn start(&self, key: &InstanceKey) -> ComputeResult<Operation> {
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        detach(async move { inner.start(&key).await }).await
    }

    /// Stop a running instance, forcing it once the grace period runs out.
    pub async fn stop(&self, key: &InstanceKey) -> ComputeResult<Operation> {
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        detach(async move { inner.stop(&key).await }).await
    }

    /// Tear an instance down: stop and remove its container, release its
    /// addresses and mark it `TERMINATED`. Takes over an instance that is
    /// still provisioning or stopping.
    pub async fn terminate(&self, key: &InstanceKey) -> ComputeResult<Operation> {
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        detach(async move { inner.terminate(&key).await }).await
    }

    /// Alias for [`terminate`](Self::terminate).
    pub async fn delete(&self, key: &InstanceKey) -> ComputeResult<Operation> {
        self.terminate(key).await
    }
}

/// An instance moved into a transitional state by one call.
struct Claim {
    slot: InstanceSlot,
    operation: Operation,
    /// Revision right after the transition. Anything else on relock means
    /// delete took the instance over.
    revision: u64,
    handle: ContainerHandle,
}

/// Run a lifecycle call on its own task and wait for it.
async fn detach<F>(call: F) -> ComputeResult<Operation>
where
    F: Future<Output = ComputeResult<Operation>> + Send + 'static,
{
    tokio::spawn(call)
        .await
        .map_err(|e| ComputeError::Internal(format!("lifecycle task failed: {e}")))?
}

impl Inner {
    // =========================================================================
    // Insert
    // =========================================================================

    async fn insert(&self, request: InsertRequest) -> ComputeResult<Operation> {
        validate_project(&request.project)?;
        validate_name("instance", &request.name)?;
        let region = region_of_zone(&request.zone)?.to_string();
        let machine_type = lookup_machine_type(&request.machine_type)?;
        let image = match request.image.as_deref() {
            Some("") => {
                return Err(ComputeError::InvalidArgument("image must not be empty".to_string()))
            }
            Some(image) => image.to_string(),
            None => self.config.default_image.clone(),
        };

        let key = request.key();
        let now = Utc::now();
        let placeholder = Instance {
            id: InstanceId::new(),
            numeric_id: NumericId::random(),
            region: region.clone(),
            machine_type: machine_type.name.to_string(),
            image,
            state: InstanceState::Provisioning,
            status_message: None,
            container_handle: None,
            internal_address: None,
            external_address: None,
            labels: request.labels.clone(),
            metadata: request.metadata.clone(),
            created_at: now,
            last_transition_at: now,
            revision: 0,
            self_link: self.links.instance(&key.project, &key.zone, &key.name),
            machine_type_link: self
                .links
                .machine_type(&key.project, &key.zone, machine_type.name),
            key: key.clone(),
        };

        let (slot, mut instance) = self.store.claim(placeholder).await?;

        // Address errors are surfaced synchronously: undo and forget the
        // placeholder.
        let internal_pool = PoolKey::internal(key.project.as_str(), region.as_str());
        let internal = match self.addresses.allocate(&internal_pool, request.network_ip).await {
            Ok(address) => address,
            Err(e) => {
                drop(instance);
                self.store.discard(&key, &slot).await;
                return Err(e);
            }
        };
        instance.internal_address = Some(internal);

        if let Some(access) = &request.external_access {
            let user = instance.self_link.clone();
            match self
                .addresses
                .bind_external(&key.project, &region, access.nat_ip, &user)
                .await
            {
                Ok(lease) => instance.external_address = Some(lease),
                Err(e) => {
                    drop(instance);
                    self.addresses.release(&internal_pool, internal).await;
                    self.store.discard(&key, &slot).await;
                    return Err(e);
                }
            }
        }

        let operation = self
            .open(&instance, OperationKind::Insert, OperationScope::Zone(key.zone.clone()))
            .await?;
        let spec = self.container_spec(&instance, machine_type.nano_cpus(), machine_type.memory_bytes());
        let revision = instance.revision;
        drop(instance);

        info!(
            instance = %key,
            machine_type = machine_type.name,
            internal_ip = %internal,
            operation = %operation.name,
            "Provisioning instance"
        );

        let created = self.runtime.create(&spec).await;
        let started = match &created {
            Ok(handle) => self.runtime.start(handle).await,
            Err(_) => Ok(()),
        };

        let outcome = {
            let mut instance = slot.lock().await;
            if instance.revision != revision {
                let err = superseded(&instance, OperationKind::Insert);
                drop(instance);
                if let Ok(handle) = &created {
                    self.discard_container(&key, handle).await;
                }
                Err(err)
            } else {
                match (created, started) {
                    (Ok(handle), Ok(())) => {
                        instance.container_handle = Some(handle);
                        instance.transition(InstanceState::Running, None);
                        Ok(())
                    }
                    (Ok(handle), Err(e)) => {
                        instance.container_handle = Some(handle);
                        Err(fail(&mut instance, OperationKind::Insert, e))
                    }
                    (Err(e), _) => Err(fail(&mut instance, OperationKind::Insert, e)),
                }
            }
        };

        self.close(&operation.key(), outcome).await
    }

    // =========================================================================
    // Start / Stop
    // =========================================================================

    async fn start(&self, key: &InstanceKey) -> ComputeResult<Operation> {
        let claim = self
            .begin(key, OperationKind::Start, InstanceState::Provisioning)
            .await?;

        info!(instance = %key, operation = %claim.operation.name, "Starting instance");
        let started = self.runtime.start(&claim.handle).await;

        let outcome = {
            let mut instance = claim.slot.lock().await;
            match started {
                _ if instance.revision != claim.revision => {
                    Err(superseded(&instance, OperationKind::Start))
                }
                Ok(()) => {
                    instance.transition(InstanceState::Running, None);
                    Ok(())
                }
                Err(e) => Err(fail(&mut instance, OperationKind::Start, e)),
            }
        };

        self.close(&claim.operation.key(), outcome).await
    }

    async fn stop(&self, key: &InstanceKey) -> ComputeResult<Operation> {
        let claim = self
            .begin(key, OperationKind::Stop, InstanceState::Stopping)
            .await?;

        info!(instance = %key, operation = %claim.operation.name, "Stopping instance");
        let stopped = self.stop_container(key, &claim.handle).await;

        let outcome = {
            let mut instance = claim.slot.lock().await;
            match stopped {
                _ if instance.revision != claim.revision => {
                    Err(superseded(&instance, OperationKind::Stop))
                }
                Ok(()) => {
                    instance.transition(InstanceState::Stopped, None);
                    Ok(())
                }
                Err(e) => Err(fail(&mut instance, OperationKind::Stop, e)),
            }
        };

        self.close(&claim.operation.key(), outcome).await
    }

    // =========================================================================
    // Delete
    // =========================================================================

    async fn terminate(&self, key: &InstanceKey) -> ComputeResult<Operation> {
        let slot = self.slot(key).await?;

        let (operation, handle) = {
            let mut instance = slot.lock().await;
            check_source(&instance, OperationKind::Delete)?;
            if instance.state.is_transitional() {
                info!(instance = %key, state = %instance.state, "Delete taking over in-flight instance");
            }
            let handle = instance.container_handle.clone();

            instance.transition(InstanceState::Terminating, None);
            let operation = self
                .open(&instance, OperationKind::Delete, OperationScope::Zone(key.zone.clone()))
                .await?;
            (operation, handle)
        };

        info!(instance = %key, operation = %operation.name, "Terminating instance");
        let removed = match &handle {
            Some(handle) => self.remove_container(key, handle).await,
            None => Ok(()),
        };

        // Nothing moves an instance out of TERMINATING but this call.
        let outcome = {
            let mut instance = slot.lock().await;
            match removed {
                Ok(()) => {
                    instance.container_handle = None;
                    self.release_addresses(&mut instance).await;
                    instance.transition(InstanceState::Terminated, None);
                    Ok(())
                }
                Err(e) => Err(fail(&mut instance, OperationKind::Delete, e)),
            }
        };

        self.close(&operation.key(), outcome).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn slot(&self, key: &InstanceKey) -> ComputeResult<InstanceSlot> {
        self.store
            .get(key)
            .await
            .ok_or_else(|| ComputeError::NotFound(format!("instance {key}")))
    }

    /// Check the source state, move to `next` and open the operation, all
    /// under the instance lock.
    async fn begin(
        &self,
        key: &InstanceKey,
        kind: OperationKind,
        next: InstanceState,
    ) -> ComputeResult<Claim> {
        let slot = self.slot(key).await?;
        let mut instance = slot.lock().await;
        check_source(&instance, kind)?;
        let handle = held_handle(&instance)?;

        instance.transition(next, None);
        let operation = self
            .open(&instance, kind, OperationScope::Zone(key.zone.clone()))
            .await?;
        let revision = instance.revision;
        drop(instance);

        Ok(Claim {
            slot,
            operation,
            revision,
            handle,
        })
    }

    /// Open an operation for `instance` and move it to `RUNNING`.
    async fn open(
        &self,
        instance: &Instance,
        kind: OperationKind,
        scope: OperationScope,
    ) -> ComputeResult<Operation> {
        let target = OperationTarget {
            id: instance.id,
            link: instance.self_link.clone(),
        };
        let operation = self
            .operations
            .create(&instance.key.project, kind, target, scope)
            .await;
        self.operations.start(&operation.key()).await
    }

    async fn close(
        &self,
        operation: &OperationKey,
        outcome: Result<(), ComputeError>,
    ) -> ComputeResult<Operation> {
        let error = outcome.err().map(|e| OperationError::from(&e));
        self.operations.complete(operation, error).await
    }

    fn container_spec(&self, instance: &Instance, nano_cpus: u64, memory_bytes: u64) -> ContainerSpec {
        let labels = BTreeMap::from([
            (LABEL_PROJECT.to_string(), instance.key.project.clone()),
            (LABEL_ZONE.to_string(), instance.key.zone.clone()),
            (LABEL_INSTANCE.to_string(), instance.key.name.clone()),
            (LABEL_INSTANCE_ID.to_string(), instance.id.to_string()),
        ]);

        let mut env = vec![
            format!("STRATUS_INSTANCE_NAME={}", instance.key.name),
            format!("STRATUS_ZONE={}", instance.key.zone),
        ];
        if let Some(ip) = instance.internal_address {
            env.push(format!("STRATUS_INTERNAL_IP={ip}"));
        }
        if let Some(lease) = &instance.external_address {
            env.push(format!("STRATUS_EXTERNAL_IP={}", lease.ip));
        }

        ContainerSpec {
            name: container_name(&instance.id),
            image: instance.image.clone(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            hostname: instance.key.name.clone(),
            nano_cpus,
            memory_bytes,
            labels,
            env,
        }
    }

    /// Graceful stop bounded by grace + escalation, then kill.
    async fn stop_container(
        &self,
        key: &InstanceKey,
        handle: &ContainerHandle,
    ) -> Result<(), RuntimeError> {
        let grace = self.config.stop_grace;
        let bound = grace + self.config.stop_escalation;

        match tokio::time::timeout(bound, self.runtime.stop(handle, grace)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    instance = %key,
                    container = %handle,
                    bound_ms = bound.as_millis() as u64,
                    "Graceful stop timed out, killing container"
                );
                self.runtime.kill(handle).await
            }
        }
    }

    /// Stop and remove; a container that is already gone counts as removed.
    async fn remove_container(
        &self,
        key: &InstanceKey,
        handle: &ContainerHandle,
    ) -> Result<(), RuntimeError> {
        match self.stop_container(key, handle).await {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => {
                info!(instance = %key, container = %handle, "Container already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self.runtime.remove(handle).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove a container that no instance records any more.
    async fn discard_container(&self, key: &InstanceKey, handle: &ContainerHandle) {
        match self.runtime.remove(handle).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                info!(instance = %key, container = %handle, "Removed orphaned container");
            }
            Err(e) => {
                warn!(instance = %key, container = %handle, error = %e, "Failed to remove orphaned container");
            }
        }
    }

    async fn release_addresses(&self, instance: &mut Instance) {
        if let Some(internal) = instance.internal_address.take() {
            let pool = PoolKey::internal(instance.key.project.as_str(), instance.region.as_str());
            self.addresses.release(&pool, internal).await;
        }
        if let Some(lease) = instance.external_address.take() {
            self.addresses.unbind_external(&lease).await;
        }
    }
}

fn check_source(instance: &Instance, kind: OperationKind) -> ComputeResult<()> {
    if instance.state.accepts(kind) {
        return Ok(());
    }
    Err(ComputeError::FailedPrecondition(format!(
        "cannot {} instance {} while it is {}",
        kind.as_str(),
        instance.key,
        instance.state
    )))
}

fn held_handle(instance: &Instance) -> ComputeResult<ContainerHandle> {
    instance.container_handle.clone().ok_or_else(|| {
        ComputeError::Internal(format!(
            "instance {} is {} but has no container",
            instance.key, instance.state
        ))
    })
}

/// Move `instance` to `ERROR` for a failed runtime call.
fn fail(instance: &mut Instance, kind: OperationKind, err: RuntimeError) -> ComputeError {
    let err = ComputeError::from(err);
    warn!(
        instance = %instance.key,
        operation_type = kind.as_str(),
        code = err.code(),
        error = %err,
        "Runtime call failed"
    );
    instance.transition(
        InstanceState::Error,
        Some(format!("{} failed: {}", kind.as_str(), err.message())),
    );
    err
}

/// Delete took the instance over while a `kind` call was waiting on the
/// runtime; the call's result is dropped.
fn superseded(instance: &Instance, kind: OperationKind) -> ComputeError {
    info!(
        instance = %instance.key,
        operation_type = kind.as_str(),
        state = %instance.state,
        "Instance taken over by delete, dropping result"
    );
    ComputeError::FailedPrecondition(format!(
        "instance {} moved to {} before {} finished",
        instance.key,
        instance.state,
        kind.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::AddressPlan;
    use crate::instance::ExternalAccess;
    use crate::operations::OperationStatus;
    use crate::runtime::{ContainerStatus, MockRuntime, RuntimeCall};
    use std::collections::HashMap;

    struct Harness {
        runtime: Arc<MockRuntime>,
        orchestrator: InstanceOrchestrator,
    }

    fn harness_with(config: OrchestratorConfig) -> Harness {
        let runtime = Arc::new(MockRuntime::new());
        let links = SelfLinks::default();
        let plan = AddressPlan {
            subnets: HashMap::new(),
            default_subnet: "10.128.0.0/29".parse().unwrap(),
            external_pools: HashMap::new(),
            default_external_pool: "203.0.113.0/29".parse().unwrap(),
        };
        let orchestrator = InstanceOrchestrator::new(
            runtime.clone(),
            Arc::new(InstanceStore::new()),
            Arc::new(OperationTracker::new(links.clone())),
            Arc::new(AddressAllocator::new(plan, links.clone())),
            links,
            config,
        );
        Harness {
            runtime,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(OrchestratorConfig::default())
    }

    fn request(name: &str) -> InsertRequest {
        InsertRequest {
            project: "p".to_string(),
            zone: "us-central1-a".to_string(),
            name: name.to_string(),
            machine_type: "e2-medium".to_string(),
            ..Default::default()
        }
    }

    fn key(name: &str) -> InstanceKey {
        InstanceKey::new("p", "us-central1-a", name)
    }

    fn internal_pool() -> PoolKey {
        PoolKey::internal("p", "us-central1")
    }

    #[tokio::test]
    async fn test_insert_runs_container_with_catalog_limits() {
        let h = harness();
        let op = h.orchestrator.insert(request("vm-1")).await.unwrap();

        assert_eq!(op.status, OperationStatus::Done);
        assert!(op.error.is_none());
        assert_eq!(op.operation_type, OperationKind::Insert);
        assert_eq!(op.scope, OperationScope::Zone("us-central1-a".to_string()));

        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        assert_eq!(view.status, InstanceState::Running);
        assert_eq!(op.target_id, view.instance_id);

        let handle = h
            .runtime
            .handle_by_name(&container_name(&view.instance_id))
            .await
            .unwrap();
        let spec = h.runtime.spec(&handle).await.unwrap();
        assert_eq!(spec.nano_cpus, 2_000_000_000);
        assert_eq!(spec.memory_bytes, 4096 * 1024 * 1024);
        assert_eq!(spec.labels[LABEL_INSTANCE], "vm-1");
        assert_eq!(h.runtime.inspect(&handle).await.unwrap(), ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_insert_validation_has_no_side_effects() {
        let h = harness();
        let available = h.orchestrator.addresses().available(&internal_pool()).await;

        let mut bad_type = request("vm-1");
        bad_type.machine_type = "m9-huge".to_string();
        let mut bad_name = request("VM_1");
        bad_name.machine_type = "e2-micro".to_string();
        let mut bad_zone = request("vm-1");
        bad_zone.zone = "nowhere".to_string();

        for req in [bad_type, bad_name, bad_zone] {
            assert!(matches!(
                h.orchestrator.insert(req).await,
                Err(ComputeError::InvalidArgument(_))
            ));
        }

        assert!(h.orchestrator.store().is_empty().await);
        assert_eq!(h.runtime.container_count().await, 0);
        assert!(h
            .orchestrator
            .operations()
            .list("p", &OperationScope::Zone("us-central1-a".to_string()))
            .await
            .is_empty());
        assert_eq!(
            h.orchestrator.addresses().available(&internal_pool()).await,
            available
        );
    }

    #[tokio::test]
    async fn test_insert_duplicate_name() {
        let h = harness();
        h.orchestrator.insert(request("vm-1")).await.unwrap();
        assert!(matches!(
            h.orchestrator.insert(request("vm-1")).await,
            Err(ComputeError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_pool_exhausted_discards_placeholder() {
        let h = harness();
        // /29 minus gateway leaves five hosts
        for i in 0..5 {
            h.orchestrator.insert(request(&format!("vm-{i}"))).await.unwrap();
        }

        let result = h.orchestrator.insert(request("vm-extra")).await;
        assert!(matches!(result, Err(ComputeError::ResourceExhausted(_))));
        assert!(matches!(
            h.orchestrator.get(&key("vm-extra")).await,
            Err(ComputeError::NotFound(_))
        ));
        assert_eq!(h.runtime.container_count().await, 5);
    }

    #[tokio::test]
    async fn test_insert_external_failure_releases_internal() {
        let h = harness();
        let before = h.orchestrator.addresses().available(&internal_pool()).await;

        let mut req = request("vm-1");
        req.external_access = Some(ExternalAccess {
            nat_ip: Some("192.0.2.10".parse().unwrap()),
        });
        assert!(matches!(
            h.orchestrator.insert(req).await,
            Err(ComputeError::InvalidArgument(_))
        ));
        assert_eq!(
            h.orchestrator.addresses().available(&internal_pool()).await,
            before
        );
        assert!(h.orchestrator.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_insert_runtime_failure_marks_error() {
        let h = harness();
        h.runtime.fail(RuntimeCall::Create).await;

        let op = h.orchestrator.insert(request("vm-1")).await.unwrap();
        assert!(op.is_done());
        assert_eq!(op.error.as_ref().unwrap().code, "UNAVAILABLE");

        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        assert_eq!(view.status, InstanceState::Error);
        assert!(view.status_message.as_ref().unwrap().starts_with("insert failed"));
        assert!(view.internal_ip().is_some());
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let h = harness();
        h.orchestrator.insert(request("vm-1")).await.unwrap();

        let op = h.orchestrator.stop(&key("vm-1")).await.unwrap();
        assert!(op.error.is_none());
        assert_eq!(
            h.orchestrator.get(&key("vm-1")).await.unwrap().status,
            InstanceState::Stopped
        );

        assert!(matches!(
            h.orchestrator.stop(&key("vm-1")).await,
            Err(ComputeError::FailedPrecondition(_))
        ));

        h.orchestrator.start(&key("vm-1")).await.unwrap();
        assert_eq!(
            h.orchestrator.get(&key("vm-1")).await.unwrap().status,
            InstanceState::Running
        );
        assert!(matches!(
            h.orchestrator.start(&key("vm-1")).await,
            Err(ComputeError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.stop(&key("ghost")).await,
            Err(ComputeError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.terminate(&key("ghost")).await,
            Err(ComputeError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_to_kill() {
        let h = harness_with(OrchestratorConfig {
            stop_grace: Duration::from_secs(1),
            stop_escalation: Duration::from_secs(1),
            ..Default::default()
        });
        h.orchestrator.insert(request("vm-1")).await.unwrap();
        h.runtime.set_stop_delay(Some(Duration::from_secs(60))).await;

        let op = h.orchestrator.stop(&key("vm-1")).await.unwrap();
        assert!(op.error.is_none());

        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        assert_eq!(view.status, InstanceState::Stopped);
        let handle = h
            .runtime
            .handle_by_name(&container_name(&view.instance_id))
            .await
            .unwrap();
        assert_eq!(h.runtime.inspect(&handle).await.unwrap(), ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_runtime_failure_marks_error() {
        let h = harness();
        h.orchestrator.insert(request("vm-1")).await.unwrap();
        h.runtime.fail(RuntimeCall::Stop).await;

        let op = h.orchestrator.stop(&key("vm-1")).await.unwrap();
        assert_eq!(op.error.unwrap().code, "UNAVAILABLE");
        assert_eq!(
            h.orchestrator.get(&key("vm-1")).await.unwrap().status,
            InstanceState::Error
        );
    }

    #[tokio::test]
    async fn test_terminate_releases_everything() {
        let h = harness();
        let before = h.orchestrator.addresses().available(&internal_pool()).await;
        let mut req = request("vm-1");
        req.external_access = Some(ExternalAccess::default());
        h.orchestrator.insert(req).await.unwrap();

        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        assert!(view.external_ip().is_some());
        let handle = h
            .runtime
            .handle_by_name(&container_name(&view.instance_id))
            .await
            .unwrap();

        let op = h.orchestrator.terminate(&key("vm-1")).await.unwrap();
        assert!(op.error.is_none());
        assert_eq!(op.operation_type, OperationKind::Delete);

        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        assert_eq!(view.status, InstanceState::Terminated);
        assert!(view.network_interfaces.is_empty());
        assert_eq!(
            h.orchestrator.addresses().available(&internal_pool()).await,
            before
        );
        assert_eq!(
            h.orchestrator
                .addresses()
                .available(&PoolKey::external("us-central1"))
                .await,
            6
        );
        assert!(matches!(
            h.runtime.start(&handle).await,
            Err(RuntimeError::NotFound(_))
        ));

        assert!(matches!(
            h.orchestrator.terminate(&key("vm-1")).await,
            Err(ComputeError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_tolerates_vanished_container() {
        let h = harness();
        h.orchestrator.insert(request("vm-1")).await.unwrap();
        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        let handle = h
            .runtime
            .handle_by_name(&container_name(&view.instance_id))
            .await
            .unwrap();
        h.runtime.forget(&handle).await;

        let op = h.orchestrator.terminate(&key("vm-1")).await.unwrap();
        assert!(op.error.is_none());
        assert_eq!(
            h.orchestrator.get(&key("vm-1")).await.unwrap().status,
            InstanceState::Terminated
        );
    }

    #[tokio::test]
    async fn test_name_reusable_after_terminate() {
        let h = harness();
        h.orchestrator.insert(request("vm-1")).await.unwrap();
        let first = h.orchestrator.get(&key("vm-1")).await.unwrap().instance_id;
        h.orchestrator.terminate(&key("vm-1")).await.unwrap();

        h.orchestrator.insert(request("vm-1")).await.unwrap();
        let second = h.orchestrator.get(&key("vm-1")).await.unwrap();
        assert_ne!(second.instance_id, first);
        assert_eq!(second.status, InstanceState::Running);
    }

    fn zone_scope() -> OperationScope {
        OperationScope::Zone("us-central1-a".to_string())
    }

    async fn status(h: &Harness, name: &str) -> InstanceState {
        h.orchestrator.get(&key(name)).await.unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_stop_still_settles() {
        let h = harness();
        h.orchestrator.insert(request("vm-1")).await.unwrap();
        h.runtime.set_stop_delay(Some(Duration::from_secs(10))).await;

        let caller = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.stop(&key("vm-1")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(status(&h, "vm-1").await, InstanceState::Stopping);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(status(&h, "vm-1").await, InstanceState::Stopped);
        let operations = h.orchestrator.operations().list("p", &zone_scope()).await;
        assert_eq!(operations.len(), 2);
        assert!(operations.iter().all(|op| op.is_done() && op.error.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_takes_over_abandoned_stop() {
        let h = harness();
        let before = h.orchestrator.addresses().available(&internal_pool()).await;
        h.orchestrator.insert(request("vm-1")).await.unwrap();
        let view = h.orchestrator.get(&key("vm-1")).await.unwrap();
        let handle = h
            .runtime
            .handle_by_name(&container_name(&view.instance_id))
            .await
            .unwrap();
        h.runtime.set_stop_delay(Some(Duration::from_secs(3600))).await;

        let caller = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.stop(&key("vm-1")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        assert_eq!(status(&h, "vm-1").await, InstanceState::Stopping);

        h.runtime.set_stop_delay(None).await;
        let op = h.orchestrator.terminate(&key("vm-1")).await.unwrap();
        assert!(op.error.is_none());
        assert_eq!(status(&h, "vm-1").await, InstanceState::Terminated);
        assert_eq!(
            h.orchestrator.addresses().available(&internal_pool()).await,
            before
        );
        assert_eq!(h.runtime.inspect(&handle).await.unwrap(), ContainerStatus::Missing);

        // The displaced stop escalates, finds nothing to kill and leaves the
        // record as delete left it.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let stop = h
            .orchestrator
            .operations()
            .list("p", &zone_scope())
            .await
            .into_iter()
            .find(|op| op.operation_type == OperationKind::Stop)
            .unwrap();
        assert!(stop.is_done());
        assert_eq!(stop.error.unwrap().code, "FAILED_PRECONDITION");
        assert_eq!(status(&h, "vm-1").await, InstanceState::Terminated);
        assert_eq!(
            h.orchestrator.addresses().available(&internal_pool()).await,
            before
        );
    }
}
