//! Instance record store with per-instance locking.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::{ComputeError, ComputeResult};
use crate::instance::{Instance, InstanceKey, InstanceState, InstanceView};

/// A single instance record and its lock.
pub type InstanceSlot = Arc<Mutex<Instance>>;

/// Instance records keyed by (project, zone, name).
#[derive(Default)]
pub struct InstanceStore {
    records: RwLock<HashMap<InstanceKey, InstanceSlot>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new record and hand it back already locked.
    ///
    /// A `TERMINATED` record under the same key is replaced (names are
    /// reusable after delete). Anything else makes this fail with
    /// `AlreadyExists`. The existing record's lock is awaited without holding
    /// the map lock, so a reader holding it only delays the claim.
    pub async fn claim(
        &self,
        instance: Instance,
    ) -> ComputeResult<(InstanceSlot, OwnedMutexGuard<Instance>)> {
        let key = instance.key.clone();
        let mut seen: Option<InstanceSlot> = None;

        loop {
            let mut records = self.records.write().await;
            let existing = match records.get(&key) {
                Some(current) if !seen.as_ref().is_some_and(|s| Arc::ptr_eq(current, s)) => {
                    Arc::clone(current)
                }
                current => {
                    // TERMINATED is final, so a slot seen terminated stays
                    // replaceable for as long as it is in the map.
                    if current.is_some() {
                        debug!(instance = %key, "Replacing terminated instance record");
                    }
                    let slot = Arc::new(Mutex::new(instance));
                    let guard = Arc::clone(&slot).try_lock_owned().map_err(|_| {
                        ComputeError::Internal(format!("fresh record for {key} is locked"))
                    })?;
                    records.insert(key, Arc::clone(&slot));
                    return Ok((slot, guard));
                }
            };
            drop(records);

            if existing.lock().await.state != InstanceState::Terminated {
                return Err(ComputeError::AlreadyExists(format!("instance {key}")));
            }
            seen = Some(existing);
        }
    }

    /// Drop a record that was claimed but never became visible as a real
    /// instance. Only removes `slot` itself, never a newer record.
    pub async fn discard(&self, key: &InstanceKey, slot: &InstanceSlot) {
        let mut records = self.records.write().await;
        if records.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            records.remove(key);
            debug!(instance = %key, "Discarded instance record");
        }
    }

    pub async fn get(&self, key: &InstanceKey) -> Option<InstanceSlot> {
        self.records.read().await.get(key).cloned()
    }

    /// Snapshot of all records. Callers lock each slot themselves.
    pub async fn slots(&self) -> Vec<(InstanceKey, InstanceSlot)> {
        let records = self.records.read().await;
        records
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Views of every instance in a zone, sorted by name.
    pub async fn list(&self, project: &str, zone: &str) -> Vec<InstanceView> {
        let mut slots: Vec<_> = self
            .slots()
            .await
            .into_iter()
            .filter(|(key, _)| key.project == project && key.zone == zone)
            .collect();
        slots.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut views = Vec::with_capacity(slots.len());
        for (_, slot) in slots {
            views.push(slot.lock().await.view());
        }
        views
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
