//! Cluster-wide snapshots.
//!
//! Every node of a cluster takes, drops or restores the same snapshot while
//! the cluster is frozen. A sync afterwards brings usage and the index in
//! line with what the nodes now hold.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{info, warn};

use crate::context::Context;
use crate::datanode::DataNode;
use crate::error::{ManagerError, Result};
use crate::synchronizer::Synchronizer;
use crate::types::Cluster;

pub struct Snapshots {
    ctx: Context,
    synchronizer: Arc<Synchronizer>,
}

impl Snapshots {
    pub fn new(ctx: Context, synchronizer: Arc<Synchronizer>) -> Self {
        Self { ctx, synchronizer }
    }

    pub fn list(&self, cluster_id: &str) -> Result<Vec<DateTime<Utc>>> {
        Ok(self.ctx.registry.get(cluster_id)?.snapshots)
    }

    /// Takes a snapshot on every node. Returns the master's timestamp.
    pub async fn create(&self, cluster_id: &str) -> Result<DateTime<Utc>> {
        let taken = self
            .on_all_nodes(cluster_id, None, |node| async move {
                node.snapshot_create().await.map(Some)
            })
            .await?;
        let taken = taken.ok_or_else(|| ManagerError::NoAvailableClusterNode(cluster_id.to_string()))?;
        info!(cluster_id, snapshot = %taken, "snapshot created");
        Ok(taken)
    }

    pub async fn delete(&self, cluster_id: &str, index: u64) -> Result<()> {
        self.on_all_nodes(cluster_id, Some(index), |node| async move {
            node.snapshot_delete(index).await.map(|_| None)
        })
        .await?;
        info!(cluster_id, index, "snapshot deleted");
        Ok(())
    }

    /// Rolls every node back to the snapshot at `index`.
    pub async fn restore(&self, cluster_id: &str, index: u64) -> Result<()> {
        self.on_all_nodes(cluster_id, Some(index), |node| async move {
            node.snapshot_restore(index).await.map(|_| None)
        })
        .await?;
        warn!(cluster_id, index, "cluster restored from snapshot");
        Ok(())
    }

    /// Freezes the cluster, runs `op` on all nodes concurrently, syncs and
    /// unfreezes. Returns the master's result.
    async fn on_all_nodes<F, Fut>(
        &self,
        cluster_id: &str,
        index: Option<u64>,
        op: F,
    ) -> Result<Option<DateTime<Utc>>>
    where
        F: Fn(Arc<dyn DataNode>) -> Fut,
        Fut: Future<Output = Result<Option<DateTime<Utc>>>>,
    {
        let cluster = self.ctx.registry.get(cluster_id)?;
        if let Some(index) = index {
            check_index(&cluster, index)?;
        }
        if self.ctx.registry.freeze(cluster_id).await? {
            return Err(ManagerError::Frozen(cluster_id.to_string()));
        }

        let results = join_all(
            cluster
                .nodes
                .iter()
                .map(|node| op(self.ctx.nodes.get(&node.address))),
        )
        .await;

        let mut master_result = None;
        let mut failures = Vec::new();
        for (node, result) in cluster.nodes.iter().zip(results) {
            match result {
                Ok(value) if node.master => master_result = value,
                Ok(_) => {}
                Err(e) => {
                    warn!(cluster_id, node = %node.id, error = %e, "snapshot operation failed");
                    failures.push(format!("{}: {e}", node.id));
                }
            }
        }

        let synced = self.synchronizer.cluster(cluster_id, true, true, true).await;
        self.ctx.registry.unfreeze(cluster_id).await?;

        if !failures.is_empty() {
            return Err(ManagerError::Bulk(failures));
        }
        synced?;
        Ok(master_result)
    }
}

fn check_index(cluster: &Cluster, index: u64) -> Result<()> {
    if index >= cluster.snapshots.len() as u64 {
        return Err(ManagerError::InvalidRequest(format!(
            "cluster {} has no snapshot at index {index}",
            cluster.id
        )));
    }
    Ok(())
}
