//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the container operations the core needs
//! to make a container stand in for a virtual machine:
//! - create/start/stop/kill/remove by opaque handle
//! - inspect the current status
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Opaque handle to a container, as issued by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name (unique per runtime).
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Command override; empty keeps the image default.
    pub command: Vec<String>,

    /// Hostname inside the container.
    pub hostname: String,

    /// CPU limit in billionths of a CPU.
    pub nano_cpus: u64,

    /// Memory limit in bytes.
    pub memory_bytes: u64,

    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,

    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
}

/// Observed container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    /// The runtime has no container for the handle.
    Missing,
}

/// Errors from runtime calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Start a created or stopped container.
    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Ask the container to stop, allowing `grace` before the runtime may
    /// force it.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    /// Force the container to stop immediately.
    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Remove the container.
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Report the container's current status.
    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus, RuntimeError>;
}

/// Runtime call kinds, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeCall {
    Create,
    Start,
    Stop,
    Kill,
    Remove,
    Inspect,
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
}

/// Mock runtime for testing and development.
///
/// Containers exist only in memory. Tests can inject failures per call kind,
/// slow down stops, and simulate drift by flipping or forgetting containers.
pub struct MockRuntime {
    /// Counter for generating handles.
    counter: AtomicU64,

    /// Containers by handle.
    containers: RwLock<HashMap<ContainerHandle, MockContainer>>,

    /// Call kinds that currently fail with `Unavailable`.
    failing: RwLock<HashSet<RuntimeCall>>,

    /// Artificial delay before a stop takes effect.
    stop_delay: RwLock<Option<Duration>>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            containers: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            stop_delay: RwLock::new(None),
        }
    }

    /// Create a mock runtime whose container creation always fails.
    pub fn failing() -> Self {
        Self {
            failing: RwLock::new(HashSet::from([RuntimeCall::Create])),
            ..Self::new()
        }
    }

    /// Make every subsequent call of `call` fail until cleared.
    pub async fn fail(&self, call: RuntimeCall) {
        self.failing.write().await.insert(call);
    }

    /// Stop injecting failures.
    pub async fn clear_failures(&self) {
        self.failing.write().await.clear();
    }

    /// Delay every stop by `delay` before it takes effect.
    pub async fn set_stop_delay(&self, delay: Option<Duration>) {
        *self.stop_delay.write().await = delay;
    }

    /// Flip a container's status behind the core's back.
    ///
    /// `Missing` removes the container.
    pub async fn set_status(&self, handle: &ContainerHandle, status: ContainerStatus) {
        let mut containers = self.containers.write().await;
        match status {
            ContainerStatus::Missing => {
                containers.remove(handle);
            }
            ContainerStatus::Running | ContainerStatus::Stopped => {
                if let Some(container) = containers.get_mut(handle) {
                    container.running = status == ContainerStatus::Running;
                }
            }
        }
    }

    /// Drop a container without going through `remove`.
    pub async fn forget(&self, handle: &ContainerHandle) -> bool {
        self.containers.write().await.remove(handle).is_some()
    }

    /// Find a container's handle by name.
    pub async fn handle_by_name(&self, name: &str) -> Option<ContainerHandle> {
        let containers = self.containers.read().await;
        containers
            .iter()
            .find(|(_, c)| c.spec.name == name)
            .map(|(handle, _)| handle.clone())
    }

    /// Spec a container was created with.
    pub async fn spec(&self, handle: &ContainerHandle) -> Option<ContainerSpec> {
        let containers = self.containers.read().await;
        containers.get(handle).map(|c| c.spec.clone())
    }

    /// Number of containers that exist.
    pub async fn container_count(&self) -> usize {
        self.containers.read().await.len()
    }

    async fn check(&self, call: RuntimeCall) -> Result<(), RuntimeError> {
        if self.failing.read().await.contains(&call) {
            return Err(RuntimeError::Unavailable(format!(
                "mock runtime configured to fail {call:?}"
            )));
        }
        Ok(())
    }

    async fn set_running(&self, handle: &ContainerHandle, running: bool) -> Result<(), RuntimeError> {
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;
        container.running = running;
        Ok(())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.check(RuntimeCall::Create).await?;

        let mut containers = self.containers.write().await;
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::Other(anyhow::anyhow!(
                "container name {} already taken",
                spec.name
            )));
        }

        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = ContainerHandle::new(format!("mock_{counter:016x}"));
        info!(
            container = %handle,
            name = %spec.name,
            image = %spec.image,
            memory_mb = spec.memory_bytes / (1024 * 1024),
            "[MOCK] Creating container"
        );
        containers.insert(
            handle.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.check(RuntimeCall::Start).await?;
        debug!(container = %handle, "[MOCK] Starting container");
        self.set_running(handle, true).await
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        self.check(RuntimeCall::Stop).await?;
        debug!(container = %handle, grace_secs = grace.as_secs(), "[MOCK] Stopping container");

        let delay = *self.stop_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.set_running(handle, false).await
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.check(RuntimeCall::Kill).await?;
        debug!(container = %handle, "[MOCK] Killing container");
        self.set_running(handle, false).await
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.check(RuntimeCall::Remove).await?;
        debug!(container = %handle, "[MOCK] Removing container");
        let mut containers = self.containers.write().await;
        containers
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus, RuntimeError> {
        self.check(RuntimeCall::Inspect).await?;
        let containers = self.containers.read().await;
        Ok(match containers.get(handle) {
            Some(c) if c.running => ContainerStatus::Running,
            Some(_) => ContainerStatus::Stopped,
            None => ContainerStatus::Missing,
        })
    }
}
