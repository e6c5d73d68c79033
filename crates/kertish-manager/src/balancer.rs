//! Usage balancing across clusters.
//!
//! The balancer repeatedly moves one chunk from the cluster with the highest
//! usage weight to the one with the lowest, until the spread drops below the
//! configured threshold or nothing movable is left. Moves run node to node;
//! the manager only plans them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::BalanceConfig;
use crate::context::Context;
use crate::error::{ManagerError, Result};
use crate::synchronizer::Synchronizer;
use crate::types::{ChunkHash, Cluster, ClusterId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BalanceReport {
    pub clusters: Vec<ClusterId>,
    pub moved: usize,
    pub failed: usize,
}

/// Planning state of one cluster.
struct Slot {
    id: ClusterId,
    address: String,
    size: u64,
    used: u64,
    /// Chunks not yet considered for moving, popped from the back.
    chunks: Vec<(ChunkHash, u64)>,
    /// Still accepts incoming chunks.
    open: bool,
}

impl Slot {
    fn weight(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        self.used as f64 / self.size as f64
    }

    fn available(&self) -> u64 {
        self.size.saturating_sub(self.used)
    }
}

struct Moved {
    source: usize,
    target: usize,
    hash: ChunkHash,
    size: u64,
    result: Result<()>,
}

pub struct Balancer {
    ctx: Context,
    synchronizer: Arc<Synchronizer>,
    config: BalanceConfig,
}

impl Balancer {
    pub fn new(ctx: Context, synchronizer: Arc<Synchronizer>, config: BalanceConfig) -> Self {
        Self {
            ctx,
            synchronizer,
            config,
        }
    }

    /// Balances the given clusters, or every eligible cluster when `cluster_ids`
    /// is empty.
    pub async fn balance(&self, cluster_ids: &[ClusterId]) -> Result<BalanceReport> {
        let clusters = self.select(cluster_ids)?;
        if clusters.len() < 2 {
            debug!(clusters = clusters.len(), "nothing to balance");
            return Ok(BalanceReport {
                clusters: clusters.into_iter().map(|c| c.id).collect(),
                ..Default::default()
            });
        }

        let ids: Vec<ClusterId> = clusters.iter().map(|c| c.id.clone()).collect();
        self.ctx.registry.set_frozen(&ids, true).await?;

        let outcome = self.run(clusters).await;

        let mut failures = Vec::new();
        for id in &ids {
            if let Err(e) = self.synchronizer.cluster(id, true, true, true).await {
                failures.push(format!("{id}: {e}"));
            }
        }
        self.ctx.registry.set_frozen(&ids, false).await?;

        let (moved, failed) = outcome?;
        info!(clusters = ids.len(), moved, failed, "balance finished");
        if !failures.is_empty() {
            return Err(ManagerError::Bulk(failures));
        }
        Ok(BalanceReport {
            clusters: ids,
            moved,
            failed,
        })
    }

    /// Checks that a balance of `cluster_ids` may start.
    pub fn validate(&self, cluster_ids: &[ClusterId]) -> Result<()> {
        self.select(cluster_ids).map(|_| ())
    }

    fn select(&self, cluster_ids: &[ClusterId]) -> Result<Vec<Cluster>> {
        if cluster_ids.is_empty() {
            return Ok(self
                .ctx
                .registry
                .get_all()?
                .into_iter()
                .filter(|c| !c.frozen && c.writable())
                .collect());
        }
        let mut selected = Vec::with_capacity(cluster_ids.len());
        for id in cluster_ids {
            let cluster = self.ctx.registry.get(id)?;
            if cluster.frozen {
                if cluster.used > 0 {
                    return Err(ManagerError::NotAvailableForClusterAction(id.clone()));
                }
                continue;
            }
            if !cluster.writable() {
                warn!(cluster_id = %id, "cluster not writable, left out of balance");
                continue;
            }
            selected.push(cluster);
        }
        Ok(selected)
    }

    async fn run(&self, clusters: Vec<Cluster>) -> Result<(usize, usize)> {
        let mut slots = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let Some(master) = cluster.master() else {
                continue;
            };
            let chunks = self
                .ctx
                .index
                .list(&cluster.id)?
                .into_iter()
                .map(|(hash, entry)| (hash, entry.size))
                .collect();
            slots.push(Slot {
                address: master.address.clone(),
                id: cluster.id.clone(),
                size: cluster.size,
                used: cluster.used,
                chunks,
                open: true,
            });
        }

        let permits: Vec<Arc<Semaphore>> = (0..slots.len())
            .map(|_| Arc::new(Semaphore::new(self.config.concurrency.max(1))))
            .collect();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Moved>();
        let mut in_flight = 0usize;
        let (mut moved, mut failed) = (0usize, 0usize);

        loop {
            while let Ok(done) = done_rx.try_recv() {
                in_flight -= 1;
                self.settle(&mut slots, done, &mut moved, &mut failed);
            }

            let Some((source, target)) = plan(&slots, self.config.threshold) else {
                break;
            };
            let Some((hash, size)) = slots[source].chunks.pop() else {
                continue;
            };
            if slots[target].available() < size {
                debug!(cluster_id = %slots[target].id, "target full, leaving balance set");
                slots[target].open = false;
                slots[source].chunks.push((hash, size));
                continue;
            }

            slots[source].used = slots[source].used.saturating_sub(size);
            slots[target].used += size;

            let permit = permits[source]
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ManagerError::Lock(e.to_string()))?;
            let node = self.ctx.nodes.get(&slots[target].address);
            let source_address = slots[source].address.clone();
            let done_tx = done_tx.clone();
            in_flight += 1;
            tokio::spawn(async move {
                let result = node.sync_move(&hash, &source_address).await;
                drop(permit);
                let _ = done_tx.send(Moved {
                    source,
                    target,
                    hash,
                    size,
                    result,
                });
            });
        }

        drop(done_tx);
        while in_flight > 0 {
            let Some(done) = done_rx.recv().await else {
                break;
            };
            in_flight -= 1;
            self.settle(&mut slots, done, &mut moved, &mut failed);
        }
        Ok((moved, failed))
    }

    fn settle(&self, slots: &mut [Slot], done: Moved, moved: &mut usize, failed: &mut usize) {
        match done.result {
            Ok(()) => {
                *moved += 1;
                self.ctx.metrics.chunk_moves_total.inc();
            }
            Err(e) => {
                *failed += 1;
                self.ctx.metrics.chunk_move_failures_total.inc();
                warn!(
                    source = %slots[done.source].id,
                    target = %slots[done.target].id,
                    hash = %done.hash,
                    error = %e,
                    "chunk move failed"
                );
                slots[done.source].used += done.size;
                slots[done.target].used = slots[done.target].used.saturating_sub(done.size);
            }
        }
    }
}

/// Fullest cluster with chunks left and emptiest open cluster, if their
/// weights are still too far apart.
fn plan(slots: &[Slot], threshold: f64) -> Option<(usize, usize)> {
    let source = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.chunks.is_empty())
        .max_by(|(_, a), (_, b)| a.weight().total_cmp(&b.weight()))
        .map(|(i, _)| i)?;
    let target = slots
        .iter()
        .enumerate()
        .filter(|(i, s)| *i != source && s.open)
        .min_by(|(_, a), (_, b)| a.weight().total_cmp(&b.weight()))
        .map(|(i, _)| i)?;
    if slots[source].weight() - slots[target].weight() < threshold {
        return None;
    }
    Some((source, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;

    fn balancer(h: &Harness) -> Balancer {
        Balancer::new(
            h.ctx.clone(),
            Arc::new(Synchronizer::new(h.ctx.clone())),
            BalanceConfig::default(),
        )
    }

    async fn synced(h: &Harness, ids: &[&str]) {
        let sync = Synchronizer::new(h.ctx.clone());
        for id in ids {
            sync.cluster(id, false, false, true).await.unwrap();
        }
    }

    fn weight(h: &Harness, id: &str) -> f64 {
        h.cluster_record(id).weight()
    }

    #[tokio::test]
    async fn close_weights_move_nothing() {
        let h = Harness::new();
        let a = h.cluster("a", &["a1"], 100).await;
        let b = h.cluster("b", &["b1"], 100).await;
        a[0].put(&[1u8; 50]);
        b[0].put(&[2u8; 54]);
        synced(&h, &["a", "b"]).await;

        let report = balancer(&h).balance(&[]).await.unwrap();
        assert_eq!(report.moved, 0);
        assert_eq!(a[0].chunks().len(), 1);
        assert_eq!(b[0].chunks().len(), 1);
        assert!(!h.cluster_record("a").frozen);
    }

    #[tokio::test]
    async fn moves_from_fullest_until_converged() {
        let h = Harness::new();
        let a = h.cluster("a", &["a1"], 1000).await;
        let b = h.cluster("b", &["b1"], 1000).await;
        for i in 0..20u8 {
            a[0].put(&[i; 30]);
        }
        synced(&h, &["a", "b"]).await;
        assert_eq!(weight(&h, "a"), 0.6);

        let report = balancer(&h).balance(&[]).await.unwrap();
        assert!(report.moved > 0);
        assert_eq!(report.failed, 0);
        assert!((weight(&h, "a") - weight(&h, "b")).abs() < 0.05);
        assert_eq!(a[0].chunks().len() + b[0].chunks().len(), 20);
        assert_eq!(h.ctx.metrics.chunk_moves_total.get(), report.moved as u64);
        let moved_hash = b[0].chunks()[0];
        assert_eq!(h.ctx.index.get(&moved_hash).unwrap().unwrap().cluster_id, "b");
    }

    #[tokio::test]
    async fn failed_moves_are_counted_and_credited_back() {
        let h = Harness::new();
        let a = h.cluster("a", &["a1"], 1000).await;
        let b = h.cluster("b", &["b1"], 1000).await;
        for i in 0..10u8 {
            a[0].put(&[i; 50]);
        }
        synced(&h, &["a", "b"]).await;
        b[0].fail_transfers(true);

        let report = balancer(&h).balance(&[]).await.unwrap();
        assert_eq!(report.moved, 0);
        assert!(report.failed > 0);
        assert_eq!(h.cluster_record("a").used, 500);
        assert!(!h.cluster_record("b").frozen);
    }

    #[tokio::test]
    async fn frozen_requested_cluster_is_rejected() {
        let h = Harness::new();
        let a = h.cluster("a", &["a1"], 100).await;
        h.cluster("b", &["b1"], 100).await;
        a[0].put(b"payload");
        synced(&h, &["a"]).await;
        h.ctx.registry.freeze("a").await.unwrap();

        let err = balancer(&h)
            .balance(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotAvailableForClusterAction(_)));
        assert!(!h.cluster_record("b").frozen);
    }

    #[test]
    fn plan_stops_without_open_targets() {
        let slot = |id: &str, used: u64, open: bool| Slot {
            id: id.to_string(),
            address: id.to_string(),
            size: 100,
            used,
            chunks: vec![(ChunkHash::of(id.as_bytes()), 1)],
            open,
        };
        assert_eq!(plan(&[slot("a", 90, true), slot("b", 10, true)], 0.05), Some((0, 1)));
        assert_eq!(plan(&[slot("a", 90, true), slot("b", 10, false)], 0.05), None);
        assert_eq!(plan(&[slot("a", 52, true), slot("b", 50, true)], 0.05), None);
    }
}
