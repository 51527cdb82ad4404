//! Long-running operation records.
//!
//! Every lifecycle call opens an [`Operation`] that clients poll until it is
//! `DONE`. Operations are scoped to a project and to the global, regional or
//! zonal namespace; the same name in two scopes names two distinct records.
//!
//! Records are never removed by the tracker. Once `DONE` a record is frozen:
//! a repeated `complete` returns the stored record unchanged.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratus_id::{InstanceId, NumericId, OperationId};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ComputeError, ComputeResult, OperationError};
use crate::naming::SelfLinks;

/// Namespace an operation lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationScope {
    Global,
    Region(String),
    Zone(String),
}

impl std::fmt::Display for OperationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Region(region) => write!(f, "regions/{region}"),
            Self::Zone(zone) => write!(f, "zones/{zone}"),
        }
    }
}

/// Lifecycle call an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Start,
    Stop,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
}

/// Resource an operation concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTarget {
    pub id: InstanceId,
    pub link: String,
}

/// Lookup key: project, scope and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub project: String,
    pub scope: OperationScope,
    pub name: OperationId,
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/{}/operations/{}", self.project, self.scope, self.name)
    }
}

/// A long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: NumericId,
    pub name: OperationId,
    pub project: String,
    pub scope: OperationScope,
    pub operation_type: OperationKind,
    pub status: OperationStatus,
    pub target_id: InstanceId,
    pub target_link: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub insert_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub self_link: String,
}

impl Operation {
    pub fn key(&self) -> OperationKey {
        OperationKey {
            project: self.project.clone(),
            scope: self.scope.clone(),
            name: self.name,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }
}

#[derive(Default)]
struct Records {
    by_key: HashMap<OperationKey, Operation>,
    by_id: HashMap<NumericId, OperationKey>,
    /// Keys in creation order.
    order: Vec<OperationKey>,
}

/// Records and serves operations.
pub struct OperationTracker {
    links: SelfLinks,
    records: RwLock<Records>,
    /// Bumped on every completion so waiters can re-check.
    completions: watch::Sender<u64>,
}

impl OperationTracker {
    pub fn new(links: SelfLinks) -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            links,
            records: RwLock::new(Records::default()),
            completions,
        }
    }

    /// Open a new operation in `PENDING`.
    pub async fn create(
        &self,
        project: &str,
        kind: OperationKind,
        target: OperationTarget,
        scope: OperationScope,
    ) -> Operation {
        let name = OperationId::new();
        let mut records = self.records.write().await;

        let mut id = NumericId::random();
        while records.by_id.contains_key(&id) {
            id = NumericId::random();
        }

        let operation = Operation {
            id,
            name,
            project: project.to_string(),
            self_link: self.links.operation(project, &scope, &name.to_string()),
            scope,
            operation_type: kind,
            status: OperationStatus::Pending,
            target_id: target.id,
            target_link: target.link,
            progress: 0,
            error: None,
            insert_time: Utc::now(),
            start_time: None,
            end_time: None,
        };

        let key = operation.key();
        debug!(operation = %key, kind = kind.as_str(), target = %operation.target_id, "Operation created");
        records.by_id.insert(id, key.clone());
        records.order.push(key.clone());
        records.by_key.insert(key, operation.clone());
        operation
    }

    /// Move an operation to `RUNNING`.
    pub async fn start(&self, key: &OperationKey) -> ComputeResult<Operation> {
        let mut records = self.records.write().await;
        let operation = records
            .by_key
            .get_mut(key)
            .ok_or_else(|| not_found(key))?;

        if operation.status == OperationStatus::Pending {
            operation.status = OperationStatus::Running;
            operation.start_time = Some(Utc::now());
        }
        Ok(operation.clone())
    }

    /// Move an operation to `DONE`, recording `error` if the call failed.
    pub async fn complete(
        &self,
        key: &OperationKey,
        error: Option<OperationError>,
    ) -> ComputeResult<Operation> {
        let completed = {
            let mut records = self.records.write().await;
            let operation = records
                .by_key
                .get_mut(key)
                .ok_or_else(|| not_found(key))?;

            if operation.is_done() {
                debug!(operation = %key, "Operation already complete");
                return Ok(operation.clone());
            }

            let now = Utc::now();
            operation.status = OperationStatus::Done;
            operation.progress = 100;
            operation.start_time.get_or_insert(now);
            operation.end_time = Some(now);
            operation.error = error;
            operation.clone()
        };

        match &completed.error {
            Some(err) => warn!(operation = %key, code = %err.code, message = %err.message, "Operation failed"),
            None => info!(operation = %key, kind = completed.operation_type.as_str(), "Operation done"),
        }
        self.completions.send_modify(|n| *n = n.wrapping_add(1));
        Ok(completed)
    }

    /// Fetch an operation by scope and name.
    pub async fn get(
        &self,
        project: &str,
        scope: &OperationScope,
        name: &str,
    ) -> ComputeResult<Operation> {
        let name = OperationId::parse(name).map_err(|_| {
            ComputeError::NotFound(format!("operation {scope}/{name} in project {project}"))
        })?;
        self.get_by_key(&OperationKey {
            project: project.to_string(),
            scope: scope.clone(),
            name,
        })
        .await
    }

    pub async fn get_by_key(&self, key: &OperationKey) -> ComputeResult<Operation> {
        let records = self.records.read().await;
        records.by_key.get(key).cloned().ok_or_else(|| not_found(key))
    }

    /// Resolve a presentation id back to its operation.
    pub async fn find_by_id(&self, id: NumericId) -> ComputeResult<Operation> {
        let records = self.records.read().await;
        records
            .by_id
            .get(&id)
            .and_then(|key| records.by_key.get(key))
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("operation with id {id}")))
    }

    /// Every operation in a scope, oldest first.
    pub async fn list(&self, project: &str, scope: &OperationScope) -> Vec<Operation> {
        let records = self.records.read().await;
        records
            .order
            .iter()
            .filter(|key| key.project == project && &key.scope == scope)
            .filter_map(|key| records.by_key.get(key))
            .cloned()
            .collect()
    }

    /// Wait until an operation is `DONE` or `timeout` elapses, returning the
    /// record as it stands at that point.
    pub async fn wait(&self, key: &OperationKey, timeout: Duration) -> ComputeResult<Operation> {
        let mut completions = self.completions.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let operation = self.get_by_key(key).await?;
            if operation.is_done() {
                return Ok(operation);
            }
            match tokio::time::timeout_at(deadline, completions.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return self.get_by_key(key).await,
            }
        }
    }
}

fn not_found(key: &OperationKey) -> ComputeError {
    ComputeError::NotFound(format!("operation {key}"))
}
