//! Stratus compute core.
//!
//! Emulates a cloud VM lifecycle API on a single container runtime: each
//! instance is one container, and clients see provider-style instances and
//! long-running operations.
//!
//! ## Architecture
//!
//! ```text
//! InstanceOrchestrator ──> AddressAllocator   (internal/external IPs)
//!        │             ──> OperationTracker   (pollable operations)
//!        │             ──> ContainerRuntime   (mock or Docker)
//!        ▼
//!   InstanceStore <── Reconciler ──> ContainerRuntime
//! ```
//!
//! The orchestrator drives request-initiated transitions; the reconciler
//! runs in the background and corrects drift between stored state and what
//! the runtime reports. Both serialize on a per-instance lock.
//!
//! ## Modules
//!
//! - `orchestrator`: the instance state machine
//! - `reconciler`: background drift correction
//! - `addresses`: address pools and reserved addresses
//! - `operations`: long-running operation records
//! - `runtime` / `docker`: container runtime interface and adapters

pub mod addresses;
pub mod catalog;
pub mod config;
pub mod docker;
pub mod error;
pub mod instance;
pub mod naming;
pub mod operations;
pub mod orchestrator;
pub mod reconciler;
pub mod runtime;
pub mod state;

// Re-export commonly used types
pub use addresses::{Address, AddressAllocator, AddressPlan, AddressStatus, PoolKey};
pub use error::{ComputeError, ComputeResult, OperationError};
pub use instance::{ExternalAccess, InsertRequest, InstanceKey, InstanceState, InstanceView};
pub use operations::{Operation, OperationKind, OperationScope, OperationStatus, OperationTracker};
pub use orchestrator::{InstanceOrchestrator, OrchestratorConfig};
pub use reconciler::{ReconcileStats, Reconciler, ReconcilerConfig, ReconcilerHandle};
pub use runtime::{ContainerRuntime, MockRuntime};
pub use state::InstanceStore;
