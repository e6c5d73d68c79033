//! Content-addressable chunk index: hash to owning cluster.

use std::collections::{BTreeSet, HashMap, HashSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::types::{ChunkHash, ClusterId, NodeId, SyncFileItem};

/// Where a chunk lives and what is known about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub cluster_id: ClusterId,
    pub size: u64,
    /// Reference count last reported by the cluster master.
    pub usage: u16,
    /// Nodes known to hold the chunk.
    pub holders: BTreeSet<NodeId>,
}

impl IndexEntry {
    fn new(cluster_id: &str, size: u64, usage: u16) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            size,
            usage,
            holders: BTreeSet::new(),
        }
    }
}

/// Storage backend for the chunk index.
pub trait ChunkIndex: Send + Sync {
    /// Adds or refreshes an entry, merging `holder` into its holder set.
    fn add(
        &self,
        cluster_id: &str,
        hash: ChunkHash,
        size: u64,
        usage: u16,
        holder: Option<&str>,
    ) -> Result<()>;

    fn remove(&self, cluster_id: &str, hash: &ChunkHash) -> Result<()>;

    /// Swaps the whole entry set of a cluster. Entries not listed are dropped.
    fn replace(&self, cluster_id: &str, items: &[SyncFileItem], holder: &str) -> Result<()>;

    fn mark_holder(&self, cluster_id: &str, hashes: &[ChunkHash], node_id: &str) -> Result<()>;

    /// First cluster among `cluster_ids` whose index contains `hash`.
    fn find(&self, cluster_ids: &[ClusterId], hash: &ChunkHash) -> Result<ClusterId>;

    /// Entry of the lowest cluster id holding `hash`.
    fn get(&self, hash: &ChunkHash) -> Result<Option<IndexEntry>> {
        Ok(self.entries(hash)?.into_iter().next())
    }

    /// Every cluster's entry for `hash`, ordered by cluster id.
    fn entries(&self, hash: &ChunkHash) -> Result<Vec<IndexEntry>>;

    fn list(&self, cluster_id: &str) -> Result<Vec<(ChunkHash, IndexEntry)>>;

    /// Entries of the cluster absent from `held`: chunks a node is missing.
    fn compare(&self, cluster_id: &str, held: &HashSet<ChunkHash>) -> Result<Vec<ChunkHash>>;

    /// Entries of the cluster absent from `confirmed`: orphaned chunks.
    fn extract(&self, cluster_id: &str, confirmed: &HashSet<ChunkHash>) -> Result<Vec<ChunkHash>>;

    fn remove_cluster(&self, cluster_id: &str) -> Result<()>;

    fn count(&self, cluster_id: &str) -> Result<usize>;
}

/// In-memory index, one hash map per cluster.
#[derive(Default)]
pub struct MemoryIndex {
    clusters: DashMap<ClusterId, HashMap<ChunkHash, IndexEntry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing_from(&self, cluster_id: &str, present: &HashSet<ChunkHash>) -> Vec<ChunkHash> {
        let mut missing: Vec<ChunkHash> = self
            .clusters
            .get(cluster_id)
            .map(|entries| {
                entries
                    .keys()
                    .filter(|h| !present.contains(*h))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        missing.sort();
        missing
    }
}

impl ChunkIndex for MemoryIndex {
    fn add(
        &self,
        cluster_id: &str,
        hash: ChunkHash,
        size: u64,
        usage: u16,
        holder: Option<&str>,
    ) -> Result<()> {
        let mut entries = self.clusters.entry(cluster_id.to_string()).or_default();
        let entry = entries
            .entry(hash)
            .or_insert_with(|| IndexEntry::new(cluster_id, size, usage));
        entry.size = size;
        entry.usage = usage;
        if let Some(holder) = holder {
            entry.holders.insert(holder.to_string());
        }
        Ok(())
    }

    fn remove(&self, cluster_id: &str, hash: &ChunkHash) -> Result<()> {
        if let Some(mut entries) = self.clusters.get_mut(cluster_id) {
            entries.remove(hash);
        }
        Ok(())
    }

    fn replace(&self, cluster_id: &str, items: &[SyncFileItem], holder: &str) -> Result<()> {
        let entries = items
            .iter()
            .map(|item| {
                let mut entry = IndexEntry::new(cluster_id, u64::from(item.size), item.usage);
                entry.holders.insert(holder.to_string());
                (item.hash, entry)
            })
            .collect();
        self.clusters.insert(cluster_id.to_string(), entries);
        Ok(())
    }

    fn mark_holder(&self, cluster_id: &str, hashes: &[ChunkHash], node_id: &str) -> Result<()> {
        if let Some(mut entries) = self.clusters.get_mut(cluster_id) {
            for hash in hashes {
                if let Some(entry) = entries.get_mut(hash) {
                    entry.holders.insert(node_id.to_string());
                }
            }
        }
        Ok(())
    }

    fn find(&self, cluster_ids: &[ClusterId], hash: &ChunkHash) -> Result<ClusterId> {
        cluster_ids
            .iter()
            .find(|id| {
                self.clusters
                    .get(id.as_str())
                    .is_some_and(|entries| entries.contains_key(hash))
            })
            .cloned()
            .ok_or(ManagerError::ChunkNotFound(*hash))
    }

    fn entries(&self, hash: &ChunkHash) -> Result<Vec<IndexEntry>> {
        let mut found: Vec<IndexEntry> = self
            .clusters
            .iter()
            .filter_map(|entries| entries.get(hash).cloned())
            .collect();
        found.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        Ok(found)
    }

    fn list(&self, cluster_id: &str) -> Result<Vec<(ChunkHash, IndexEntry)>> {
        let mut list: Vec<(ChunkHash, IndexEntry)> = self
            .clusters
            .get(cluster_id)
            .map(|entries| entries.iter().map(|(h, e)| (*h, e.clone())).collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(list)
    }

    fn compare(&self, cluster_id: &str, held: &HashSet<ChunkHash>) -> Result<Vec<ChunkHash>> {
        Ok(self.missing_from(cluster_id, held))
    }

    fn extract(&self, cluster_id: &str, confirmed: &HashSet<ChunkHash>) -> Result<Vec<ChunkHash>> {
        Ok(self.missing_from(cluster_id, confirmed))
    }

    fn remove_cluster(&self, cluster_id: &str) -> Result<()> {
        self.clusters.remove(cluster_id);
        Ok(())
    }

    fn count(&self, cluster_id: &str) -> Result<usize> {
        Ok(self.clusters.get(cluster_id).map_or(0, |e| e.len()))
    }
}
