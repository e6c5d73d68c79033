//! Write placement, space reservations and chunk lookups.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PlacementConfig;
use crate::context::Context;
use crate::error::{ManagerError, Result};
use crate::registry::ClustersTx;
use crate::types::{
    ChunkHash, Chunk, Cluster, ClusterId, MapType, ReservationMap, ReservationMapEntry,
};

/// Resolved location of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub cluster_id: ClusterId,
    pub address: String,
}

pub struct Placement {
    ctx: Context,
    config: PlacementConfig,
}

impl Placement {
    pub fn new(ctx: Context, config: PlacementConfig) -> Self {
        Self { ctx, config }
    }

    /// Splits `size` bytes into fixed-size chunks with a shorter tail.
    pub fn split(&self, size: u64) -> Vec<Chunk> {
        let chunk_size = self.config.chunk_size.max(1);
        let mut chunks = Vec::with_capacity((size / chunk_size + 1) as usize);
        let mut offset = 0;
        let mut sequence = 0;
        while offset < size {
            let len = chunk_size.min(size - offset);
            chunks.push(Chunk {
                sequence,
                size: len,
            });
            offset += len;
            sequence += 1;
        }
        chunks
    }

    /// Reserves space for a write of `size` bytes, chunk by chunk, on the
    /// least used eligible clusters. Nothing is reserved when any chunk fails.
    pub async fn reserve(&self, size: u64) -> Result<ReservationMap> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.ctx.registry.lock_all().await?;
        let mut entries = Vec::new();

        for chunk in self.split(size) {
            let cluster_id = pick(&tx, chunk.size)
                .map(|c| c.id.clone())
                .ok_or(ManagerError::NoDiskSpace { needed: chunk.size })?;
            let cluster = tx.get_mut(&cluster_id)?;
            cluster.reserve(&id, chunk.size)?;
            let address = cluster
                .master()
                .map(|m| m.address.clone())
                .ok_or_else(|| ManagerError::NoAvailableClusterNode(cluster_id.clone()))?;
            entries.push(ReservationMapEntry {
                cluster_id,
                address,
                chunk,
            });
        }

        tx.commit().await?;
        self.ctx.metrics.reservations_total.inc();
        debug!(reservation = %id, size, chunks = entries.len(), "space reserved");
        Ok(ReservationMap {
            id,
            clusters: entries,
        })
    }

    /// Turns a reservation into permanent usage. Clusters missing from
    /// `written` commit zero bytes.
    pub async fn commit(&self, reservation_id: &str, written: &HashMap<ClusterId, u64>) -> Result<()> {
        let mut tx = self.ctx.registry.lock_all().await?;
        let mut found = false;
        for cluster in tx.clusters_mut() {
            let bytes = written.get(&cluster.id).copied().unwrap_or(0);
            found |= cluster.commit(reservation_id, bytes);
        }
        if !found {
            return Err(ManagerError::ReservationNotFound(reservation_id.to_string()));
        }
        tx.commit().await?;
        info!(reservation = %reservation_id, "reservation committed");
        Ok(())
    }

    pub async fn discard(&self, reservation_id: &str) -> Result<()> {
        let mut tx = self.ctx.registry.lock_all().await?;
        let mut found = false;
        for cluster in tx.clusters_mut() {
            found |= cluster.discard(reservation_id);
        }
        if !found {
            return Err(ManagerError::ReservationNotFound(reservation_id.to_string()));
        }
        tx.commit().await?;
        info!(reservation = %reservation_id, "reservation discarded");
        Ok(())
    }

    /// Resolves where a chunk should be read from, deduplicated into or deleted from.
    pub fn find(&self, hash: &ChunkHash, map_type: MapType) -> Result<ChunkLocation> {
        let clusters = self.ctx.registry.get_all()?;
        locate(&self.ctx, &clusters, hash, map_type)
    }

    pub fn placement_map(
        &self,
        hashes: &[ChunkHash],
        map_type: MapType,
    ) -> Result<BTreeMap<ChunkHash, ChunkLocation>> {
        let clusters = self.ctx.registry.get_all()?;
        hashes
            .iter()
            .map(|hash| Ok((*hash, locate(&self.ctx, &clusters, hash, map_type)?)))
            .collect()
    }
}

/// Lowest weight first, then most available. Frozen clusters only when
/// nothing else fits.
fn pick(tx: &ClustersTx, size: u64) -> Option<&Cluster> {
    let best = |frozen: bool| {
        tx.clusters()
            .filter(|c| c.frozen == frozen && c.writable() && c.available() >= size)
            .min_by(|a, b| {
                a.weight()
                    .total_cmp(&b.weight())
                    .then(b.available().cmp(&a.available()))
            })
    };
    best(false).or_else(|| best(true))
}

fn locate(
    ctx: &Context,
    clusters: &[Cluster],
    hash: &ChunkHash,
    map_type: MapType,
) -> Result<ChunkLocation> {
    let eligible = |c: &&Cluster| match map_type {
        MapType::Read => c.state.readable(),
        MapType::Create | MapType::Delete => c.state.writable(),
    };
    let ids: Vec<ClusterId> = clusters.iter().filter(eligible).map(|c| c.id.clone()).collect();
    let owner_id = ctx.index.find(&ids, hash)?;
    let owner = clusters
        .iter()
        .find(|c| c.id == owner_id)
        .ok_or_else(|| ManagerError::ClusterNotFound(owner_id.clone()))?;
    let unavailable = || ManagerError::NoAvailableClusterNode(owner.id.clone());

    let node = match map_type {
        MapType::Read => {
            let holders: Vec<String> = ctx
                .index
                .get(hash)?
                .filter(|e| e.cluster_id == owner.id)
                .map(|e| e.holders.into_iter().collect())
                .unwrap_or_default();
            owner
                .best_node(Some(holders.as_slice()))
                .or_else(|| owner.master().filter(|m| m.is_reachable()))
                .ok_or_else(unavailable)?
        }
        MapType::Create | MapType::Delete => {
            if owner.paralyzed {
                return Err(unavailable());
            }
            owner.master().ok_or_else(unavailable)?
        }
    };
    Ok(ChunkLocation {
        cluster_id: owner.id.clone(),
        address: node.address.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::types::{ClusterState, QUALITY_UNREACHABLE};

    fn placement(h: &Harness, chunk_size: u64) -> Placement {
        Placement::new(h.ctx.clone(), PlacementConfig { chunk_size })
    }

    async fn set_used(h: &Harness, id: &str, used: u64) {
        let mut tx = h.ctx.registry.lock(id).await.unwrap();
        tx.used = used;
        tx.commit().await.unwrap();
    }

    #[test]
    fn split_has_remainder_tail() {
        let h = Harness::new();
        let chunks = placement(&h, 32).split(70);
        let sizes: Vec<u64> = chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![32, 32, 6]);
        assert_eq!(chunks[2].sequence, 2);
        assert!(placement(&h, 32).split(0).is_empty());
    }

    #[tokio::test]
    async fn reserve_prefers_least_used_cluster() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        h.cluster("b", &["b1"], 100).await;
        set_used(&h, "b", 80).await;

        let map = placement(&h, 32).reserve(10).await.unwrap();
        assert_eq!(map.clusters.len(), 1);
        assert_eq!(map.clusters[0].cluster_id, "a");
        assert_eq!(map.clusters[0].address, "a1");
        assert_eq!(h.cluster_record("a").used, 10);
        assert_eq!(h.cluster_record("b").used, 80);
    }

    #[tokio::test]
    async fn reserve_spreads_chunks_as_weights_change() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        h.cluster("b", &["b1"], 100).await;
        let map = placement(&h, 10).reserve(40).await.unwrap();
        let on_a = map.clusters.iter().filter(|e| e.cluster_id == "a").count();
        assert_eq!(on_a, 2);
        assert_eq!(h.cluster_record("a").used + h.cluster_record("b").used, 40);
    }

    #[tokio::test]
    async fn frozen_only_as_fallback() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        h.cluster("b", &["b1"], 100).await;
        h.ctx.registry.freeze("a").await.unwrap();
        set_used(&h, "b", 50).await;

        let map = placement(&h, 32).reserve(10).await.unwrap();
        assert_eq!(map.clusters[0].cluster_id, "b");

        set_used(&h, "b", 100).await;
        let map = placement(&h, 32).reserve(10).await.unwrap();
        assert_eq!(map.clusters[0].cluster_id, "a");
    }

    #[tokio::test]
    async fn no_space_leaves_usage_untouched() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        set_used(&h, "a", 60).await;
        let err = placement(&h, 32).reserve(64).await.unwrap_err();
        assert!(matches!(err, ManagerError::NoDiskSpace { .. }));
        let cluster = h.cluster_record("a");
        assert_eq!(cluster.used, 60);
        assert!(cluster.reservations.is_empty());
    }

    #[tokio::test]
    async fn offline_and_paralyzed_clusters_are_skipped() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        h.cluster("b", &["b1"], 100).await;
        {
            let mut tx = h.ctx.registry.lock_all().await.unwrap();
            tx.get_mut("a").unwrap().state = ClusterState::Offline;
            tx.get_mut("b").unwrap().paralyzed = true;
            tx.commit().await.unwrap();
        }
        let err = placement(&h, 32).reserve(1).await.unwrap_err();
        assert!(matches!(err, ManagerError::NoDiskSpace { needed: 1 }));
    }

    #[tokio::test]
    async fn commit_and_discard_settle_reservations() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        h.cluster("b", &["b1"], 100).await;
        let p = placement(&h, 10);

        let map = p.reserve(20).await.unwrap();
        let written: HashMap<ClusterId, u64> =
            [("a".to_string(), 7), ("b".to_string(), 9)].into_iter().collect();
        p.commit(&map.id, &written).await.unwrap();
        assert_eq!(h.cluster_record("a").used + h.cluster_record("b").used, 16);
        assert!(matches!(
            p.commit(&map.id, &written).await.unwrap_err(),
            ManagerError::ReservationNotFound(_)
        ));

        let map = p.reserve(30).await.unwrap();
        p.discard(&map.id).await.unwrap();
        assert_eq!(h.cluster_record("a").used + h.cluster_record("b").used, 16);
        assert!(p.discard(&map.id).await.is_err());
    }

    #[tokio::test]
    async fn find_resolves_by_map_type() {
        let h = Harness::new();
        h.cluster("a", &["a1", "a2"], 100).await;
        let hash = ChunkHash::of(b"chunk");
        h.ctx.index.add("a", hash, 5, 1, Some("a2")).unwrap();
        let p = placement(&h, 32);

        assert_eq!(p.find(&hash, MapType::Read).unwrap().address, "a2");
        assert_eq!(p.find(&hash, MapType::Create).unwrap().address, "a1");
        assert_eq!(p.find(&hash, MapType::Delete).unwrap().address, "a1");

        let missing = ChunkHash::of(b"missing");
        assert!(matches!(
            p.find(&missing, MapType::Create).unwrap_err(),
            ManagerError::ChunkNotFound(_)
        ));
        assert!(p.placement_map(&[hash, missing], MapType::Read).is_err());
        assert_eq!(p.placement_map(&[hash], MapType::Read).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn readonly_cluster_serves_reads_only() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        let hash = ChunkHash::of(b"chunk");
        h.ctx.index.add("a", hash, 5, 1, Some("a1")).unwrap();
        {
            let mut tx = h.ctx.registry.lock("a").await.unwrap();
            tx.state = ClusterState::Readonly;
            tx.commit().await.unwrap();
        }
        let p = placement(&h, 32);
        assert!(p.find(&hash, MapType::Read).is_ok());
        assert!(p.find(&hash, MapType::Delete).is_err());
    }

    #[tokio::test]
    async fn read_skips_unreachable_holders() {
        let h = Harness::new();
        h.cluster("a", &["a1", "a2"], 100).await;
        let hash = ChunkHash::of(b"chunk");
        h.ctx.index.add("a", hash, 5, 1, Some("a1")).unwrap();
        h.ctx.index.add("a", hash, 5, 1, Some("a2")).unwrap();
        {
            let mut tx = h.ctx.registry.lock("a").await.unwrap();
            tx.node_mut("a1").unwrap().quality = QUALITY_UNREACHABLE;
            tx.commit().await.unwrap();
        }
        let location = placement(&h, 32).find(&hash, MapType::Read).unwrap();
        assert_eq!(location.address, "a2");
    }
}
