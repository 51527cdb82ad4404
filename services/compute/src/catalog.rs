//! Static machine-type catalog.
//!
//! Machine types are resolved to container CPU and memory limits when an
//! instance is inserted.

use serde::Serialize;

use crate::error::{ComputeError, ComputeResult};

/// A machine type the emulator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineType {
    pub name: &'static str,
    pub guest_cpus: u32,
    pub memory_mb: u64,
    pub is_shared_cpu: bool,
}

impl MachineType {
    /// CPU limit for the backing container.
    pub fn nano_cpus(&self) -> u64 {
        u64::from(self.guest_cpus) * 1_000_000_000
    }

    /// Memory limit for the backing container.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }
}

const fn machine(name: &'static str, guest_cpus: u32, memory_mb: u64, is_shared_cpu: bool) -> MachineType {
    MachineType {
        name,
        guest_cpus,
        memory_mb,
        is_shared_cpu,
    }
}

static CATALOG: &[MachineType] = &[
    machine("e2-micro", 2, 1024, true),
    machine("e2-small", 2, 2048, true),
    machine("e2-medium", 2, 4096, true),
    machine("e2-standard-2", 2, 8192, false),
    machine("e2-standard-4", 4, 16384, false),
    machine("e2-standard-8", 8, 32768, false),
    machine("n1-standard-1", 1, 3840, false),
    machine("n1-standard-2", 2, 7680, false),
    machine("n1-standard-4", 4, 15360, false),
    machine("n2-standard-2", 2, 8192, false),
    machine("n2-standard-4", 4, 16384, false),
    machine("n2-standard-8", 8, 32768, false),
    machine("c2-standard-4", 4, 16384, false),
];

/// Every machine type in the catalog.
pub fn list_machine_types() -> &'static [MachineType] {
    CATALOG
}

/// Resolve a machine type by short name or partial URL
/// (`zones/us-central1-a/machineTypes/e2-medium`).
pub fn lookup_machine_type(reference: &str) -> ComputeResult<&'static MachineType> {
    let name = reference.rsplit('/').next().unwrap_or(reference);
    CATALOG
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| ComputeError::InvalidArgument(format!("unknown machine type '{reference}'")))
}
