//! Durable cluster and node records.
//!
//! Every mutation goes through a transaction handle: [`Registry::lock`] for a
//! single cluster, [`Registry::lock_all`] for operations spanning clusters.
//! A handle holds the relevant locks, exposes a working copy, persists it on
//! `commit` and discards it when dropped. Multi-cluster transactions take the
//! global `clusters` key first and then the per-cluster keys in id order, so
//! concurrent callers always lock in the same order.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{ManagerError, Result};
use crate::locks::{LockGuard, Locker};
use crate::types::{Cluster, ClusterId, NodeId, RepairDetail};

const ALL_CLUSTERS_KEY: &str = "clusters";

fn cluster_key(id: &str) -> String {
    format!("cluster:{id}")
}

/// Storage backend for cluster documents.
///
/// Implementations must apply `save_all` atomically: either every listed
/// change becomes visible or none does.
pub trait ClusterStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Cluster>>;

    fn get_all(&self) -> Result<Vec<Cluster>>;

    /// Secondary lookup: the cluster that owns a node id.
    fn find_by_node(&self, node_id: &str) -> Result<Option<ClusterId>>;

    fn save(&self, cluster: Cluster) -> Result<()>;

    fn save_all(&self, clusters: Vec<Cluster>, deleted: Vec<ClusterId>) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    fn repair_detail(&self) -> Result<RepairDetail>;

    fn save_repair_detail(&self, detail: RepairDetail) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    clusters: BTreeMap<ClusterId, Cluster>,
    nodes: HashMap<NodeId, ClusterId>,
    repair: RepairDetail,
}

impl MemoryState {
    fn put(&mut self, cluster: Cluster) {
        self.drop_cluster(&cluster.id);
        for node in &cluster.nodes {
            self.nodes.insert(node.id.clone(), cluster.id.clone());
        }
        self.clusters.insert(cluster.id.clone(), cluster);
    }

    fn drop_cluster(&mut self, id: &str) {
        if let Some(old) = self.clusters.remove(id) {
            for node in &old.nodes {
                self.nodes.remove(&node.id);
            }
        }
    }
}

/// In-memory cluster document store.
#[derive(Default)]
pub struct MemoryClusterStore {
    state: RwLock<MemoryState>,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|e| ManagerError::Store(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|e| ManagerError::Store(e.to_string()))
    }
}

impl ClusterStore for MemoryClusterStore {
    fn get(&self, id: &str) -> Result<Option<Cluster>> {
        Ok(self.read()?.clusters.get(id).cloned())
    }

    fn get_all(&self) -> Result<Vec<Cluster>> {
        Ok(self.read()?.clusters.values().cloned().collect())
    }

    fn find_by_node(&self, node_id: &str) -> Result<Option<ClusterId>> {
        Ok(self.read()?.nodes.get(node_id).cloned())
    }

    fn save(&self, cluster: Cluster) -> Result<()> {
        self.write()?.put(cluster);
        Ok(())
    }

    fn save_all(&self, clusters: Vec<Cluster>, deleted: Vec<ClusterId>) -> Result<()> {
        let mut state = self.write()?;
        for id in &deleted {
            state.drop_cluster(id);
        }
        for cluster in clusters {
            state.put(cluster);
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.write()?.drop_cluster(id);
        Ok(())
    }

    fn repair_detail(&self) -> Result<RepairDetail> {
        Ok(self.read()?.repair.clone())
    }

    fn save_repair_detail(&self, detail: RepairDetail) -> Result<()> {
        self.write()?.repair = detail;
        Ok(())
    }
}

/// Cluster registry with per-key locking.
pub struct Registry {
    store: Arc<dyn ClusterStore>,
    locker: Locker,
}

impl Registry {
    pub fn new(store: Arc<dyn ClusterStore>, locker: Locker) -> Self {
        Self { store, locker }
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    pub fn get(&self, id: &str) -> Result<Cluster> {
        self.store
            .get(id)?
            .ok_or_else(|| ManagerError::ClusterNotFound(id.to_string()))
    }

    pub fn get_all(&self) -> Result<Vec<Cluster>> {
        self.store.get_all()
    }

    pub fn ids(&self) -> Result<Vec<ClusterId>> {
        Ok(self.store.get_all()?.into_iter().map(|c| c.id).collect())
    }

    pub fn find_by_node(&self, node_id: &str) -> Result<Cluster> {
        let cluster_id = self
            .store
            .find_by_node(node_id)?
            .ok_or_else(|| ManagerError::NodeNotFound(node_id.to_string()))?;
        self.get(&cluster_id)
    }

    pub fn find_by_address(&self, address: &str) -> Result<Cluster> {
        self.store
            .get_all()?
            .into_iter()
            .find(|c| c.node_by_address(address).is_some())
            .ok_or_else(|| ManagerError::NodeNotFound(address.to_string()))
    }

    /// Locks one cluster and returns its working copy.
    pub async fn lock(&self, id: &str) -> Result<ClusterTx> {
        let guard = self.locker.lock(&cluster_key(id)).await?;
        let cluster = self.get(id)?;
        Ok(ClusterTx {
            store: self.store.clone(),
            guard: Some(guard),
            original: cluster.clone(),
            cluster,
        })
    }

    /// Locks every cluster and returns working copies of all of them.
    pub async fn lock_all(&self) -> Result<ClustersTx> {
        let mut guards = vec![self.locker.lock(ALL_CLUSTERS_KEY).await?];
        let mut ids = self.ids()?;
        ids.sort();
        for id in &ids {
            guards.push(self.locker.lock(&cluster_key(id)).await?);
        }

        let clusters: BTreeMap<ClusterId, Cluster> = self
            .store
            .get_all()?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        debug!(clusters = clusters.len(), "locked all clusters");
        Ok(ClustersTx {
            store: self.store.clone(),
            guards,
            original: clusters.clone(),
            clusters,
            deleted: Vec::new(),
        })
    }

    /// Freezes one cluster. Returns whether it was frozen already.
    pub async fn freeze(&self, id: &str) -> Result<bool> {
        let mut tx = self.lock(id).await?;
        let was_frozen = tx.frozen;
        tx.frozen = true;
        tx.commit().await?;
        Ok(was_frozen)
    }

    pub async fn unfreeze(&self, id: &str) -> Result<()> {
        let mut tx = self.lock(id).await?;
        tx.frozen = false;
        tx.commit().await.map(|_| ())
    }

    pub async fn set_frozen(&self, ids: &[ClusterId], frozen: bool) -> Result<()> {
        let mut tx = self.lock_all().await?;
        for id in ids {
            tx.get_mut(id)?.frozen = frozen;
        }
        tx.commit().await
    }

    pub fn repair_detail(&self) -> Result<RepairDetail> {
        self.store.repair_detail()
    }

    pub fn save_repair_detail(&self, detail: RepairDetail) -> Result<()> {
        self.store.save_repair_detail(detail)
    }
}

/// Locked working copy of one cluster. Dropping it without `commit` rolls back.
pub struct ClusterTx {
    store: Arc<dyn ClusterStore>,
    guard: Option<LockGuard>,
    cluster: Cluster,
    original: Cluster,
}

impl ClusterTx {
    /// Persists the working copy (when changed) and releases the lock.
    pub async fn commit(mut self) -> Result<Cluster> {
        let cluster = std::mem::replace(&mut self.cluster, Cluster::new(""));
        if cluster != self.original {
            self.store.save(cluster.clone())?;
        }
        self.release().await?;
        Ok(cluster)
    }

    /// Removes the cluster record and releases the lock.
    pub async fn delete(mut self) -> Result<()> {
        self.store.delete(&self.original.id)?;
        self.release().await
    }

    async fn release(&mut self) -> Result<()> {
        match self.guard.take() {
            Some(guard) => guard.unlock().await,
            None => Ok(()),
        }
    }
}

impl Deref for ClusterTx {
    type Target = Cluster;

    fn deref(&self) -> &Cluster {
        &self.cluster
    }
}

impl DerefMut for ClusterTx {
    fn deref_mut(&mut self) -> &mut Cluster {
        &mut self.cluster
    }
}

/// Locked working copies of every cluster. Dropping it without `commit` rolls back.
pub struct ClustersTx {
    store: Arc<dyn ClusterStore>,
    guards: Vec<LockGuard>,
    clusters: BTreeMap<ClusterId, Cluster>,
    original: BTreeMap<ClusterId, Cluster>,
    deleted: Vec<ClusterId>,
}

impl ClustersTx {
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn clusters_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
        self.clusters.values_mut()
    }

    pub fn get(&self, id: &str) -> Result<&Cluster> {
        self.clusters
            .get(id)
            .ok_or_else(|| ManagerError::ClusterNotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Cluster> {
        self.clusters
            .get_mut(id)
            .ok_or_else(|| ManagerError::ClusterNotFound(id.to_string()))
    }

    pub fn find_node(&self, node_id: &str) -> Option<&Cluster> {
        self.clusters.values().find(|c| c.node(node_id).is_some())
    }

    /// Fails when the cluster id or any of its nodes is already present.
    pub fn ensure_absent(&self, cluster: &Cluster) -> Result<()> {
        if self.get(&cluster.id).is_ok() {
            return Err(ManagerError::Exists(cluster.id.clone()));
        }
        for node in &cluster.nodes {
            if let Some(owner) = self.find_node(&node.id) {
                return Err(ManagerError::Registered {
                    node_id: node.id.clone(),
                    cluster_id: owner.id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, cluster: Cluster) {
        self.deleted.retain(|id| id != &cluster.id);
        self.clusters.insert(cluster.id.clone(), cluster);
    }

    pub fn remove(&mut self, id: &str) -> Option<Cluster> {
        let removed = self.clusters.remove(id);
        if removed.is_some() && self.original.contains_key(id) {
            self.deleted.push(id.to_string());
        }
        removed
    }

    /// Persists every changed, new or removed cluster in one store write.
    pub async fn commit(mut self) -> Result<()> {
        let changed: Vec<Cluster> = self
            .clusters
            .values()
            .filter(|c| self.original.get(&c.id) != Some(*c))
            .cloned()
            .collect();
        let deleted = std::mem::take(&mut self.deleted);
        if !changed.is_empty() || !deleted.is_empty() {
            self.store.save_all(changed, deleted)?;
        }
        for guard in self.guards.drain(..).rev() {
            guard.unlock().await?;
        }
        Ok(())
    }
}
