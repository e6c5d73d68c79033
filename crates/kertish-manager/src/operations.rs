//! Status table for detached background operations.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::Result;

pub type OperationId = u64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Running,
    Complete,
    Failed(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    /// `sync`, `repair`, `balance`, `move`, ...
    pub kind: String,
    /// What the operation acts on, e.g. a cluster id list.
    pub target: String,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, OperationState::Running)
    }
}

pub struct OperationTracker {
    operations: Mutex<BTreeMap<OperationId, Operation>>,
    next_id: AtomicU64,
    /// Finished operations kept for listing.
    retain: usize,
}

impl OperationTracker {
    pub fn new(retain: usize) -> Self {
        Self {
            operations: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            retain,
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<OperationId, Operation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, kind: &str, target: &str) -> OperationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.table().insert(
            id,
            Operation {
                id,
                kind: kind.to_string(),
                target: target.to_string(),
                state: OperationState::Running,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub fn finish(&self, id: OperationId, outcome: &Result<()>) {
        let mut table = self.table();
        if let Some(op) = table.get_mut(&id) {
            op.state = match outcome {
                Ok(()) => OperationState::Complete,
                Err(e) => OperationState::Failed(e.to_string()),
            };
            op.updated_at = Utc::now();
        }
        Self::prune(&mut table, self.retain);
    }

    fn prune(table: &mut BTreeMap<OperationId, Operation>, retain: usize) {
        let finished: Vec<OperationId> = table
            .values()
            .filter(|op| op.is_terminal())
            .map(|op| op.id)
            .collect();
        let excess = finished.len().saturating_sub(retain);
        for id in finished.into_iter().take(excess) {
            table.remove(&id);
        }
    }

    pub fn get(&self, id: OperationId) -> Option<Operation> {
        self.table().get(&id).cloned()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Operation> {
        self.table().values().rev().cloned().collect()
    }

    /// Runs `task` in the background and records its outcome.
    pub fn spawn<F>(self: &Arc<Self>, kind: &str, target: &str, task: F) -> OperationId
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.start(kind, target);
        let tracker = Arc::clone(self);
        let kind = kind.to_string();
        tokio::spawn(async move {
            let outcome = task.await;
            match &outcome {
                Ok(()) => info!(operation = id, kind = %kind, "operation complete"),
                Err(e) => error!(operation = id, kind = %kind, error = %e, "operation failed"),
            }
            tracker.finish(id, &outcome);
        });
        id
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ManagerError;
    use std::time::Duration;

    #[test]
    fn finish_records_outcome() {
        let tracker = OperationTracker::new(10);
        let ok = tracker.start("sync", "c1");
        let failed = tracker.start("balance", "");
        tracker.finish(ok, &Ok(()));
        tracker.finish(failed, &Err(ManagerError::Processing));

        assert_eq!(tracker.get(ok).unwrap().state, OperationState::Complete);
        assert!(matches!(
            tracker.get(failed).unwrap().state,
            OperationState::Failed(ref msg) if msg.contains("in progress")
        ));
        assert_eq!(tracker.list()[0].id, failed);
    }

    #[test]
    fn prune_keeps_running_and_newest_finished() {
        let tracker = OperationTracker::new(2);
        let running = tracker.start("repair", "");
        let ids: Vec<_> = (0..4).map(|_| tracker.start("sync", "c")).collect();
        for id in &ids {
            tracker.finish(*id, &Ok(()));
        }
        assert!(tracker.get(running).is_some());
        assert!(tracker.get(ids[0]).is_none());
        assert!(tracker.get(ids[1]).is_none());
        assert!(tracker.get(ids[3]).is_some());
        assert_eq!(tracker.get(running).unwrap().state, OperationState::Running);
    }

    #[tokio::test]
    async fn spawn_tracks_background_task() {
        let tracker = Arc::new(OperationTracker::default());
        let id = tracker.spawn("move", "a,b", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        assert_eq!(tracker.get(id).unwrap().state, OperationState::Running);
        for _ in 0..100 {
            if tracker.get(id).unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.get(id).unwrap().state, OperationState::Complete);
    }
}
