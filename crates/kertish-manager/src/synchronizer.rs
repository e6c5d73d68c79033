//! Cluster synchronization.
//!
//! A sync pulls the authoritative chunk list from a cluster's master, resets
//! the cluster's usage and index entries from it, and asks every slave to
//! copy the master's content.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{ManagerError, Result};
use crate::types::{ChunkHash, ClusterId, Node};

pub struct Synchronizer {
    ctx: Context,
    /// Clusters with a background sync queued or running; `true` asks for one more run.
    pending: DashMap<ClusterId, bool>,
}

impl Synchronizer {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            pending: DashMap::new(),
        }
    }

    /// Synchronizes one cluster.
    ///
    /// Fails with `Frozen` when another operation froze the cluster, unless
    /// `force` is set. The freeze taken here is lifted on exit unless
    /// `keep_frozen` is set. With `wait_full_sync` the slave resyncs are
    /// awaited, otherwise they continue in the background.
    pub async fn cluster(
        &self,
        cluster_id: &str,
        force: bool,
        keep_frozen: bool,
        wait_full_sync: bool,
    ) -> Result<()> {
        let was_frozen = self.ctx.registry.freeze(cluster_id).await?;
        if was_frozen && !force {
            return Err(ManagerError::Frozen(cluster_id.to_string()));
        }

        let started = Instant::now();
        let result = self.pull(cluster_id, wait_full_sync).await;

        if !keep_frozen && !was_frozen {
            if let Err(e) = self.ctx.registry.unfreeze(cluster_id).await {
                warn!(cluster_id, error = %e, "failed to unfreeze after sync");
            }
        }

        let metrics = &self.ctx.metrics;
        metrics.syncs_total.inc();
        metrics
            .sync_duration_ms
            .observe(started.elapsed().as_millis() as u64);
        match &result {
            Ok(()) => info!(cluster_id, "cluster synchronized"),
            Err(e) => {
                metrics.sync_failures_total.inc();
                warn!(cluster_id, error = %e, "cluster sync failed");
            }
        }
        result
    }

    async fn pull(&self, cluster_id: &str, wait_full_sync: bool) -> Result<()> {
        let cluster = self.ctx.registry.get(cluster_id)?;
        let master = cluster
            .master()
            .cloned()
            .ok_or_else(|| ManagerError::NoAvailableClusterNode(cluster_id.to_string()))?;

        let container = self
            .ctx
            .nodes
            .get(&master.address)
            .sync_list(None)
            .await
            .map_err(|e| ManagerError::Sync {
                cluster_id: cluster_id.to_string(),
                reason: e.to_string(),
            })?;

        let mut tx = self.ctx.registry.lock(cluster_id).await?;
        tx.reset_usage(container.used, container.snapshots.clone());
        tx.commit().await?;
        self.ctx
            .index
            .replace(cluster_id, &container.file_items, &master.id)?;
        debug!(
            cluster_id,
            chunks = container.file_items.len(),
            used = container.used,
            "index rebuilt from master"
        );

        let slaves: Vec<Node> = cluster.slaves().cloned().collect();
        if slaves.is_empty() {
            return Ok(());
        }
        let fan_out = resync_slaves(
            self.ctx.clone(),
            cluster_id.to_string(),
            master.address,
            container.used,
            slaves,
            Arc::new(container.hashes()),
        );
        if wait_full_sync {
            fan_out.await;
        } else {
            tokio::spawn(fan_out);
        }
        Ok(())
    }

    /// Schedules a background sync. Requests for a cluster whose sync is
    /// already queued or running collapse into one follow-up run.
    /// Returns false when the request was merged.
    pub fn queue_cluster(self: &Arc<Self>, cluster_id: &str) -> bool {
        match self.pending.entry(cluster_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut queued) => {
                *queued.get_mut() = true;
                debug!(cluster_id, "sync already queued");
                return false;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(false);
            }
        }

        let this = Arc::clone(self);
        let cluster_id = cluster_id.to_string();
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.cluster(&cluster_id, false, false, true).await {
                    debug!(cluster_id = %cluster_id, error = %e, "queued sync failed");
                }
                if this
                    .pending
                    .remove_if(&cluster_id, |_, again| !*again)
                    .is_some()
                {
                    break;
                }
                if let Some(mut again) = this.pending.get_mut(&cluster_id) {
                    *again = false;
                }
            }
        });
        true
    }

    pub fn is_queued(&self, cluster_id: &str) -> bool {
        self.pending.contains_key(cluster_id)
    }

    /// Synchronizes every cluster, collecting failures into `Bulk`.
    pub async fn all(&self, force: bool) -> Result<()> {
        let ids = self.ctx.registry.ids()?;
        let results = join_all(ids.iter().map(|id| async move {
            (id, self.cluster(id, force, false, true).await)
        }))
        .await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(id, r)| r.err().map(|e| format!("{id}: {e}")))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Bulk(failures))
        }
    }
}

async fn resync_slaves(
    ctx: Context,
    cluster_id: ClusterId,
    master_address: String,
    bytes: u64,
    slaves: Vec<Node>,
    hashes: Arc<Vec<ChunkHash>>,
) {
    let jobs = slaves.into_iter().map(|slave| {
        let ctx = ctx.clone();
        let cluster_id = cluster_id.clone();
        let master_address = master_address.clone();
        let hashes = hashes.clone();
        async move {
            let outcome = async {
                ctx.nodes
                    .get(&slave.address)
                    .sync_full(&master_address, bytes)
                    .await?;
                ctx.index.mark_holder(&cluster_id, &hashes, &slave.id)
            }
            .await;
            if let Err(e) = outcome {
                warn!(cluster_id = %cluster_id, node = %slave.id, error = %e, "slave resync failed");
            }
        }
    });
    join_all(jobs).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use std::time::Duration;

    #[tokio::test]
    async fn rebuilds_usage_index_and_slaves() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "s1", "s2"], 1 << 20).await;
        let a = sims[0].put(b"alpha");
        let b = sims[0].put(b"beta");
        h.ctx.index.add("c1", ChunkHash::of(b"stale"), 5, 1, None).unwrap();
        {
            let mut tx = h.ctx.registry.lock("c1").await.unwrap();
            tx.reserve("r1", 1000).unwrap();
            tx.commit().await.unwrap();
        }

        let sync = Synchronizer::new(h.ctx.clone());
        sync.cluster("c1", false, false, true).await.unwrap();

        let cluster = h.cluster_record("c1");
        assert_eq!(cluster.used, 9);
        assert!(cluster.reservations.is_empty());
        assert!(!cluster.frozen);
        assert!(h.ctx.index.get(&ChunkHash::of(b"stale")).unwrap().is_none());
        let entry = h.ctx.index.get(&a).unwrap().unwrap();
        assert_eq!(entry.holders.len(), 3);
        assert!(sims[1].has(&b) && sims[2].has(&b));
    }

    #[tokio::test]
    async fn frozen_cluster_needs_force() {
        let h = Harness::new();
        h.cluster("c1", &["m"], 100).await;
        h.ctx.registry.freeze("c1").await.unwrap();
        let sync = Synchronizer::new(h.ctx.clone());

        let err = sync.cluster("c1", false, false, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::Frozen(_)));

        sync.cluster("c1", true, false, true).await.unwrap();
        assert!(h.cluster_record("c1").frozen);
    }

    #[tokio::test]
    async fn keep_frozen_leaves_freeze() {
        let h = Harness::new();
        h.cluster("c1", &["m"], 100).await;
        let sync = Synchronizer::new(h.ctx.clone());
        sync.cluster("c1", false, true, true).await.unwrap();
        assert!(h.cluster_record("c1").frozen);
    }

    #[tokio::test]
    async fn unreachable_master_fails_sync() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "s"], 100).await;
        sims[0].set_alive(false);
        let sync = Synchronizer::new(h.ctx.clone());
        let err = sync.cluster("c1", false, false, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::Sync { .. }));
        assert!(!h.cluster_record("c1").frozen);
    }

    #[tokio::test]
    async fn all_aggregates_failures() {
        let h = Harness::new();
        h.cluster("ok", &["a"], 100).await;
        let sims = h.cluster("broken", &["b"], 100).await;
        sims[0].set_alive(false);
        let sync = Synchronizer::new(h.ctx.clone());
        match sync.all(false).await {
            Err(ManagerError::Bulk(items)) => {
                assert_eq!(items.len(), 1);
                assert!(items[0].starts_with("broken"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_requests_coalesce() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m"], 100).await;
        sims[0].put(b"x");
        let sync = Arc::new(Synchronizer::new(h.ctx.clone()));
        assert!(sync.queue_cluster("c1"));
        assert!(!sync.queue_cluster("c1"));
        for _ in 0..200 {
            if !sync.is_queued("c1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sync.is_queued("c1"));
        assert_eq!(h.cluster_record("c1").used, 1);
    }
}
