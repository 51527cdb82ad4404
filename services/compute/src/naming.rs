//! Resource names, zones and self links.

use crate::error::{ComputeError, ComputeResult};
use crate::operations::OperationScope;

/// Default API base for self links.
pub const DEFAULT_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

const MAX_NAME_LEN: usize = 63;

/// Validate a resource name: `[a-z]([-a-z0-9]{0,61}[a-z0-9])?`.
pub fn validate_name(kind: &str, name: &str) -> ComputeResult<()> {
    let bytes = name.as_bytes();
    let valid = match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= MAX_NAME_LEN
                && first.is_ascii_lowercase()
                && (last.is_ascii_lowercase() || last.is_ascii_digit())
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ComputeError::InvalidArgument(format!(
            "invalid {kind} name '{name}': must be 1-63 characters of lowercase letters, digits \
             or hyphens, start with a letter and not end with a hyphen"
        )))
    }
}

/// Validate a project id.
pub fn validate_project(project: &str) -> ComputeResult<()> {
    if project.trim().is_empty() || project.contains('/') {
        return Err(ComputeError::InvalidArgument(format!(
            "invalid project '{project}'"
        )));
    }
    Ok(())
}

/// Derive the region from a zone (`us-central1-a` → `us-central1`).
pub fn region_of_zone(zone: &str) -> ComputeResult<&str> {
    match zone.rsplit_once('-') {
        Some((region, suffix))
            if region.contains('-')
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_lowercase()) =>
        {
            Ok(region)
        }
        _ => Err(ComputeError::InvalidArgument(format!("invalid zone '{zone}'"))),
    }
}

/// Builds provider-style self links.
#[derive(Debug, Clone)]
pub struct SelfLinks {
    base: String,
}

impl SelfLinks {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn instance(&self, project: &str, zone: &str, name: &str) -> String {
        format!("{}/projects/{project}/zones/{zone}/instances/{name}", self.base)
    }

    pub fn operation(&self, project: &str, scope: &OperationScope, name: &str) -> String {
        let scope_path = match scope {
            OperationScope::Global => "global".to_string(),
            OperationScope::Region(region) => format!("regions/{region}"),
            OperationScope::Zone(zone) => format!("zones/{zone}"),
        };
        format!("{}/projects/{project}/{scope_path}/operations/{name}", self.base)
    }

    pub fn address(&self, project: &str, region: &str, name: &str) -> String {
        format!("{}/projects/{project}/regions/{region}/addresses/{name}", self.base)
    }

    pub fn machine_type(&self, project: &str, zone: &str, machine_type: &str) -> String {
        format!(
            "{}/projects/{project}/zones/{zone}/machineTypes/{machine_type}",
            self.base
        )
    }
}

impl Default for SelfLinks {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}
