//! Instance records and the lifecycle state machine.
//!
//! ## State Machine
//!
//! ```text
//! (insert) -> provisioning -> running -> stopping -> stopped
//!                                ^                      |
//!                                +--- provisioning <----+   (start)
//!
//! any non-terminated -> terminating -> terminated          (delete)
//! any non-terminal   -> error                              (runtime failure / drift)
//! ```
//!
//! Transitional states (`PROVISIONING`, `STOPPING`, `TERMINATING`) mark an
//! instance as claimed by the request that put it there. That request runs to
//! completion on its own task even if its caller goes away. Delete may take
//! over a `PROVISIONING` or `STOPPING` instance; the displaced request then
//! finds the revision moved and leaves the record alone. Everything else fails
//! precondition checks, and the reconciler skips transitional instances.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratus_id::{InstanceId, NumericId};
use tracing::debug;

use crate::addresses::ExternalLease;
use crate::operations::OperationKind;
use crate::runtime::ContainerHandle;

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
        }
    }

    /// No lifecycle transition other than delete leaves these states, and the
    /// reconciler never touches them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// An in-flight request owns the instance.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Stopping | Self::Terminating)
    }

    /// Whether a lifecycle call of `kind` may begin from this state.
    pub fn accepts(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Insert => false,
            OperationKind::Start => *self == Self::Stopped,
            OperationKind::Stop => *self == Self::Running,
            OperationKind::Delete => !matches!(self, Self::Terminating | Self::Terminated),
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an instance: unique per (project, zone).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(project: impl Into<String>, zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project, self.zone, self.name
        )
    }
}

/// External access requested at insert time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalAccess {
    /// Specific external IP. Matches a reserved address if one exists,
    /// otherwise it is claimed as an ephemeral IP.
    pub nat_ip: Option<Ipv4Addr>,
}

/// Parameters of an `insert` call.
#[derive(Debug, Clone, Default)]
pub struct InsertRequest {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub machine_type: String,
    /// Container image; the configured default when unset.
    pub image: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    /// Preferred internal IP.
    pub network_ip: Option<Ipv4Addr>,
    pub external_access: Option<ExternalAccess>,
}

impl InsertRequest {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.project, &self.zone, &self.name)
    }
}

/// Stored instance record.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub numeric_id: NumericId,
    pub key: InstanceKey,
    pub region: String,
    pub machine_type: String,
    pub image: String,
    pub state: InstanceState,
    pub status_message: Option<String>,
    pub(crate) container_handle: Option<ContainerHandle>,
    pub internal_address: Option<Ipv4Addr>,
    pub external_address: Option<ExternalLease>,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// Bumped on every state change; lets a writer detect that the record
    /// moved while it was not holding the lock.
    pub revision: u64,
    pub self_link: String,
    pub machine_type_link: String,
}

impl Instance {
    /// Move to `next`, stamping the transition time.
    pub fn transition(&mut self, next: InstanceState, message: Option<String>) {
        debug!(
            instance = %self.key,
            from = %self.state,
            to = %next,
            "Instance state transition"
        );
        self.state = next;
        self.status_message = message;
        self.last_transition_at = Utc::now();
        self.revision += 1;
        debug_assert!(
            self.is_consistent(),
            "instance {} is {} with container {:?}",
            self.key,
            self.state,
            self.container_handle
        );
    }

    /// Handle presence matches state: only running/stopped/transitional
    /// records past creation hold a container, and terminated ones never do.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            InstanceState::Running | InstanceState::Stopped | InstanceState::Stopping => {
                self.container_handle.is_some()
            }
            InstanceState::Terminated => self.container_handle.is_none(),
            InstanceState::Provisioning | InstanceState::Terminating | InstanceState::Error => true,
        }
    }

    /// Client-facing representation (never includes the container handle).
    pub fn view(&self) -> InstanceView {
        let access_configs = self
            .external_address
            .iter()
            .map(|lease| AccessConfigView {
                name: "External NAT".to_string(),
                kind: "ONE_TO_ONE_NAT".to_string(),
                nat_ip: lease.ip,
                reserved: lease.reserved.is_some(),
            })
            .collect();

        let network_interfaces = self
            .internal_address
            .map(|network_ip| NetworkInterfaceView {
                name: "nic0".to_string(),
                network: "default".to_string(),
                network_ip,
                access_configs,
            })
            .into_iter()
            .collect();

        InstanceView {
            id: self.numeric_id,
            instance_id: self.id,
            name: self.key.name.clone(),
            project: self.key.project.clone(),
            zone: self.key.zone.clone(),
            machine_type: self.machine_type_link.clone(),
            image: self.image.clone(),
            status: self.state,
            status_message: self.status_message.clone(),
            network_interfaces,
            labels: self.labels.clone(),
            metadata: self.metadata.clone(),
            creation_timestamp: self.created_at,
            last_transition_timestamp: self.last_transition_at,
            self_link: self.self_link.clone(),
        }
    }
}

/// Instance as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub id: NumericId,
    pub instance_id: InstanceId,
    pub name: String,
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub image: String,
    pub status: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub network_interfaces: Vec<NetworkInterfaceView>,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub creation_timestamp: DateTime<Utc>,
    pub last_transition_timestamp: DateTime<Utc>,
    pub self_link: String,
}

impl InstanceView {
    pub fn internal_ip(&self) -> Option<Ipv4Addr> {
        self.network_interfaces.first().map(|nic| nic.network_ip)
    }

    pub fn external_ip(&self) -> Option<Ipv4Addr> {
        self.network_interfaces
            .first()
            .and_then(|nic| nic.access_configs.first())
            .map(|ac| ac.nat_ip)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceView {
    pub name: String,
    pub network: String,
    #[serde(rename = "networkIP")]
    pub network_ip: Ipv4Addr,
    pub access_configs: Vec<AccessConfigView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfigView {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "natIP")]
    pub nat_ip: Ipv4Addr,
    pub reserved: bool,
}
