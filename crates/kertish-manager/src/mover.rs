//! Whole-cluster migration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BalanceConfig;
use crate::context::Context;
use crate::error::{ManagerError, Result};
use crate::synchronizer::Synchronizer;
use crate::types::{ChunkHash, Cluster};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveReport {
    pub source: String,
    pub target: String,
    pub moved: usize,
}

pub struct Mover {
    ctx: Context,
    synchronizer: Arc<Synchronizer>,
    config: BalanceConfig,
}

impl Mover {
    pub fn new(ctx: Context, synchronizer: Arc<Synchronizer>, config: BalanceConfig) -> Self {
        Self {
            ctx,
            synchronizer,
            config,
        }
    }

    /// Moves every chunk of `source_id` to `target_id`.
    ///
    /// On success the source is left frozen and empty. Its snapshots are
    /// dropped since they cannot follow the data.
    pub async fn move_cluster(&self, source_id: &str, target_id: &str) -> Result<MoveReport> {
        if source_id == target_id {
            return Err(ManagerError::InvalidRequest(
                "source and target cluster are the same".into(),
            ));
        }
        let source = self.ctx.registry.get(source_id)?;
        let target = self.ctx.registry.get(target_id)?;

        let mut frozen_here = Vec::with_capacity(2);
        for cluster in [&source, &target] {
            if self.ctx.registry.freeze(&cluster.id).await? {
                if cluster.used > 0 {
                    self.release(&frozen_here).await;
                    return Err(ManagerError::NotAvailableForClusterAction(cluster.id.clone()));
                }
            } else {
                frozen_here.push(cluster.id.clone());
            }
        }

        let result = self.transfer(source_id, target_id).await;

        for id in [source_id, target_id] {
            if let Err(e) = self.synchronizer.cluster(id, true, true, true).await {
                warn!(cluster_id = id, error = %e, "sync after move failed");
            }
        }

        match result {
            Ok(moved) => {
                let target_only: Vec<String> =
                    frozen_here.into_iter().filter(|id| id == target_id).collect();
                self.release(&target_only).await;
                info!(source = source_id, target = target_id, moved, "cluster moved");
                Ok(MoveReport {
                    source: source_id.to_string(),
                    target: target_id.to_string(),
                    moved,
                })
            }
            Err(e) => {
                self.release(&frozen_here).await;
                warn!(source = source_id, target = target_id, error = %e, "cluster move failed");
                Err(e)
            }
        }
    }

    async fn release(&self, ids: &[String]) {
        if let Err(e) = self.ctx.registry.set_frozen(ids, false).await {
            warn!(clusters = ?ids, error = %e, "failed to unfreeze after move");
        }
    }

    async fn transfer(&self, source_id: &str, target_id: &str) -> Result<usize> {
        self.synchronizer.cluster(source_id, true, true, true).await?;
        let source = self.ctx.registry.get(source_id)?;
        let target = self.ctx.registry.get(target_id)?;
        if target.available() < source.used {
            return Err(ManagerError::NoDiskSpace {
                needed: source.used,
            });
        }
        let source_master = master_address(&source)?;
        let target_master = master_address(&target)?;

        self.drop_snapshots(&source).await;

        let chunks: Vec<ChunkHash> = self
            .ctx
            .index
            .list(source_id)?
            .into_iter()
            .map(|(hash, _)| hash)
            .collect();
        let total = chunks.len();
        let allowed = (total as f64 * self.config.max_failure_ratio).floor() as usize;
        let failed = AtomicUsize::new(0);
        let node = self.ctx.nodes.get(&target_master);

        let failures: Vec<String> = stream::iter(chunks)
            .map(|hash| {
                let node = node.clone();
                let source_master = source_master.as_str();
                let failed = &failed;
                async move {
                    if failed.load(Ordering::SeqCst) > allowed {
                        return Some(format!("{hash}: skipped"));
                    }
                    match node.sync_move(&hash, source_master).await {
                        Ok(()) => {
                            self.ctx.metrics.chunk_moves_total.inc();
                            None
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            self.ctx.metrics.chunk_move_failures_total.inc();
                            Some(format!("{hash}: {e}"))
                        }
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .filter_map(|f| async move { f })
            .collect()
            .await;

        let failed = failed.into_inner();
        if failed > allowed {
            return Err(ManagerError::TooManyErrors { failed, total });
        }
        if !failures.is_empty() {
            return Err(ManagerError::Bulk(failures));
        }
        Ok(total)
    }

    async fn drop_snapshots(&self, source: &Cluster) {
        for index in (0..source.snapshots.len() as u64).rev() {
            for node in &source.nodes {
                if let Err(e) = self.ctx.nodes.get(&node.address).snapshot_delete(index).await {
                    warn!(cluster_id = %source.id, node = %node.id, index, error = %e, "snapshot drop failed");
                }
            }
        }
    }
}

fn master_address(cluster: &Cluster) -> Result<String> {
    cluster
        .master()
        .map(|m| m.address.clone())
        .ok_or_else(|| ManagerError::NoAvailableClusterNode(cluster.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datanode::DataNode;
    use crate::test_support::Harness;

    fn mover(h: &Harness) -> Mover {
        Mover::new(
            h.ctx.clone(),
            Arc::new(Synchronizer::new(h.ctx.clone())),
            BalanceConfig::default(),
        )
    }

    #[tokio::test]
    async fn moves_everything_and_keeps_source_frozen() {
        let h = Harness::new();
        let src = h.cluster("src", &["s1", "s2"], 1000).await;
        let dst = h.cluster("dst", &["d1"], 1000).await;
        for i in 0..8u8 {
            src[0].put(&[i; 20]);
        }
        src[0].snapshot_create().await.unwrap();
        Synchronizer::new(h.ctx.clone())
            .cluster("src", false, false, true)
            .await
            .unwrap();

        let report = mover(&h).move_cluster("src", "dst").await.unwrap();
        assert_eq!(report.moved, 8);
        assert!(src[0].chunks().is_empty());
        assert_eq!(src[0].snapshot_count(), 0);
        assert_eq!(dst[0].chunks().len(), 8);

        let source = h.cluster_record("src");
        assert!(source.frozen);
        assert_eq!(source.used, 0);
        let target = h.cluster_record("dst");
        assert!(!target.frozen);
        assert_eq!(target.used, 160);
        assert_eq!(h.ctx.index.count("dst").unwrap(), 8);
    }

    #[tokio::test]
    async fn target_must_fit_source() {
        let h = Harness::new();
        let src = h.cluster("src", &["s1"], 1000).await;
        h.cluster("dst", &["d1"], 100).await;
        src[0].put(&[7u8; 200]);

        let err = mover(&h).move_cluster("src", "dst").await.unwrap_err();
        assert!(matches!(err, ManagerError::NoDiskSpace { needed: 200 }));
        assert!(src[0].has(&ChunkHash::of(&[7u8; 200])));
        assert!(!h.cluster_record("src").frozen);
        assert!(!h.cluster_record("dst").frozen);
    }

    #[tokio::test]
    async fn too_many_failures_abort() {
        let h = Harness::new();
        let src = h.cluster("src", &["s1"], 1000).await;
        let dst = h.cluster("dst", &["d1"], 1000).await;
        for i in 0..5u8 {
            src[0].put(&[i; 10]);
        }
        dst[0].fail_transfers(true);

        let err = mover(&h).move_cluster("src", "dst").await.unwrap_err();
        assert!(matches!(err, ManagerError::TooManyErrors { total: 5, .. }));
        assert_eq!(src[0].chunks().len(), 5);
        assert!(!h.cluster_record("src").frozen);
    }

    #[tokio::test]
    async fn frozen_non_empty_cluster_is_rejected() {
        let h = Harness::new();
        let src = h.cluster("src", &["s1"], 1000).await;
        h.cluster("dst", &["d1"], 1000).await;
        src[0].put(b"data");
        Synchronizer::new(h.ctx.clone())
            .cluster("src", false, false, true)
            .await
            .unwrap();
        h.ctx.registry.freeze("src").await.unwrap();

        let err = mover(&h).move_cluster("src", "dst").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotAvailableForClusterAction(_)));
        assert!(h.cluster_record("src").frozen);
        assert!(!h.cluster_record("dst").frozen);
        assert!(mover(&h).move_cluster("dst", "dst").await.is_err());
    }
}
