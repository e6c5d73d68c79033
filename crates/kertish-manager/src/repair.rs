//! Two-phase repair: folder tree structure, then chunk integrity.
//!
//! Only one repair runs at a time across all managers. The `repair` lock
//! enforces that; the persisted [`RepairDetail`] makes the running state
//! visible to status queries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{ManagerError, Result};
use crate::metadata::{rebuild_tree, MetadataStore};
use crate::synchronizer::Synchronizer;
use crate::types::{ChunkHash, ClusterId, RepairDetail, RepairType};

pub const REPAIR_LOCK: &str = "repair";
pub const METADATA_TREE_LOCK: &str = "metadata-tree";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub folders_fixed: usize,
    pub zombies: usize,
    pub resurrected: usize,
    pub orphans_deleted: usize,
    pub orphans_failed: usize,
}

pub struct RepairEngine {
    ctx: Context,
    synchronizer: Arc<Synchronizer>,
    metadata: Arc<dyn MetadataStore>,
}

impl RepairEngine {
    pub fn new(
        ctx: Context,
        synchronizer: Arc<Synchronizer>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            ctx,
            synchronizer,
            metadata,
        }
    }

    /// True while some manager holds the repair lock.
    pub async fn is_running(&self) -> Result<bool> {
        self.ctx.registry.locker().is_locked(REPAIR_LOCK).await
    }

    pub fn status(&self) -> Result<RepairDetail> {
        self.ctx.registry.repair_detail()
    }

    /// Runs the passes selected by `repair_type`. Fails with `Processing` when
    /// another repair holds the lock.
    pub async fn run(&self, repair_type: RepairType) -> Result<RepairReport> {
        let guard = self
            .ctx
            .registry
            .locker()
            .try_lock(REPAIR_LOCK)
            .await?
            .ok_or(ManagerError::Processing)?;

        if self.status()?.processing {
            warn!("previous repair did not finish cleanly");
        }
        self.ctx.registry.save_repair_detail(RepairDetail {
            processing: true,
            repair_type: Some(repair_type),
            timestamp: None,
            error: None,
        })?;
        self.ctx.metrics.repairs_total.inc();
        info!(?repair_type, "repair started");

        let result = self.passes(repair_type).await;

        let detail = RepairDetail {
            processing: false,
            repair_type: Some(repair_type),
            timestamp: Some(Utc::now()),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = self.ctx.registry.save_repair_detail(detail) {
            warn!(error = %e, "failed to record repair outcome");
        }
        guard.unlock().await?;

        match &result {
            Ok(report) => info!(?repair_type, ?report, "repair finished"),
            Err(e) => warn!(?repair_type, error = %e, "repair failed"),
        }
        result
    }

    async fn passes(&self, repair_type: RepairType) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        if repair_type.structure() {
            report.folders_fixed = self.structure().await?;
        }
        if repair_type.integrity() {
            self.integrity(&mut report).await?;
        }
        Ok(report)
    }

    /// Rebuilds the folder tree and writes back only the folders that differ.
    async fn structure(&self) -> Result<usize> {
        let guard = self
            .ctx
            .registry
            .locker()
            .lock(METADATA_TREE_LOCK)
            .await?;
        let outcome = (|| -> Result<usize> {
            let folders = self.metadata.folders()?;
            let files = self.metadata.files()?;
            let fix = rebuild_tree(&folders, &files);
            if !fix.is_empty() {
                self.metadata.save_folders(&fix.changed, &fix.deleted)?;
            }
            Ok(fix.changed.len() + fix.deleted.len())
        })();
        guard.unlock().await?;
        let fixed = outcome?;
        info!(fixed, "folder structure repaired");
        Ok(fixed)
    }

    async fn integrity(&self, report: &mut RepairReport) -> Result<()> {
        let ids = self.ctx.registry.ids()?;
        for id in &ids {
            // Frozen clusters are synced too and keep their freeze.
            self.synchronizer
                .cluster(id, true, false, true)
                .await
                .map_err(|e| ManagerError::Sync {
                    cluster_id: id.clone(),
                    reason: e.to_string(),
                })?;
        }

        let confirmed = self.check_files(report)?;

        for id in &ids {
            let present = confirmed.get(id).cloned().unwrap_or_default();
            let orphans = self.ctx.index.extract(id, &present)?;
            if orphans.is_empty() {
                continue;
            }
            self.delete_orphans(id, &orphans, report).await?;
            self.synchronizer.queue_cluster(id);
        }
        Ok(())
    }

    /// Marks or resurrects zombie files and collects the chunks each cluster
    /// is confirmed to hold on behalf of some file.
    fn check_files(
        &self,
        report: &mut RepairReport,
    ) -> Result<HashMap<ClusterId, HashSet<ChunkHash>>> {
        let mut confirmed: HashMap<ClusterId, HashSet<ChunkHash>> = HashMap::new();
        for mut file in self.metadata.files()? {
            let mut zombie = false;
            for chunk in &file.chunks {
                let entries = self.ctx.index.entries(&chunk.hash)?;
                match entries.iter().find(|e| e.size == chunk.size) {
                    Some(entry) => {
                        confirmed
                            .entry(entry.cluster_id.clone())
                            .or_default()
                            .insert(chunk.hash);
                    }
                    None if entries.is_empty() => {
                        debug!(file = %file.full_path, hash = %chunk.hash, "chunk missing");
                        zombie = true;
                    }
                    None => {
                        debug!(file = %file.full_path, hash = %chunk.hash, expected = chunk.size, found = entries[0].size, "chunk size mismatch");
                        zombie = true;
                    }
                }
            }
            if zombie == file.zombie {
                continue;
            }
            if zombie {
                report.zombies += 1;
                self.ctx.metrics.zombies_total.inc();
                warn!(file = %file.full_path, "file marked zombie");
            } else {
                report.resurrected += 1;
                info!(file = %file.full_path, "zombie file resurrected");
            }
            file.zombie = zombie;
            self.metadata.save_file(&file)?;
        }
        Ok(confirmed)
    }

    async fn delete_orphans(
        &self,
        cluster_id: &str,
        orphans: &[ChunkHash],
        report: &mut RepairReport,
    ) -> Result<()> {
        let cluster = self.ctx.registry.get(cluster_id)?;
        let master = cluster
            .master()
            .ok_or_else(|| ManagerError::NoAvailableClusterNode(cluster_id.to_string()))?;
        let node = self.ctx.nodes.get(&master.address);

        let taken = node.snapshot_create().await.map_err(|e| {
            ManagerError::Repair(format!("snapshot of cluster {cluster_id} failed: {e}"))
        })?;
        info!(cluster_id, orphans = orphans.len(), snapshot = %taken, "deleting orphan chunks");

        for hash in orphans {
            match node.sync_delete(hash).await {
                Ok(()) => {
                    self.ctx.index.remove(cluster_id, hash)?;
                    self.ctx.metrics.orphans_deleted_total.inc();
                    report.orphans_deleted += 1;
                    debug!(cluster_id, hash = %hash, "orphan deleted");
                }
                Err(e) => {
                    report.orphans_failed += 1;
                    warn!(cluster_id, hash = %hash, error = %e, "orphan delete failed");
                }
            }
        }
        Ok(())
    }
}
