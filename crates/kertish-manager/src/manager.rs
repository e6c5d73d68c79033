//! The manager facade: wires the components together and exposes every
//! administrative and node-facing operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::Balancer;
use crate::config::ManagerConfig;
use crate::context::Context;
use crate::datanode::{DataNodeConnector, DataNodes, TcpConnector};
use crate::error::{ManagerError, Result};
use crate::health::{ClusterHealth, HealthTracker};
use crate::index::{ChunkIndex, MemoryIndex};
use crate::locks::{LockService, Locker, MemoryLockService};
use crate::metadata::{MemoryMetadata, MetadataStore};
use crate::metrics::ManagerMetrics;
use crate::mover::Mover;
use crate::operations::{Operation, OperationId, OperationTracker};
use crate::placement::{ChunkLocation, Placement};
use crate::registry::{ClusterStore, MemoryClusterStore, Registry};
use crate::repair::RepairEngine;
use crate::replication::{NodeEvent, Replication};
use crate::snapshot::Snapshots;
use crate::synchronizer::Synchronizer;
use crate::types::{
    ChunkHash, Cluster, ClusterId, ClusterState, MapType, Node, NodeId, RepairDetail, RepairType,
    ReservationMap,
};

/// What a data node learns about itself when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub master_address: String,
}

/// Repair state as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairStatus {
    pub running: bool,
    pub detail: RepairDetail,
}

/// Deterministic cluster id from its founding members.
pub fn cluster_id_for(node_ids: &[NodeId]) -> ClusterId {
    let mut hasher = Sha256::new();
    for id in node_ids {
        hasher.update(id.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

pub struct ManagerBuilder {
    config: ManagerConfig,
    store: Option<Arc<dyn ClusterStore>>,
    index: Option<Arc<dyn ChunkIndex>>,
    locks: Option<Arc<dyn LockService>>,
    connector: Option<Arc<dyn DataNodeConnector>>,
    metadata: Option<Arc<dyn MetadataStore>>,
}

impl ManagerBuilder {
    pub fn cluster_store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(mut self, index: Arc<dyn ChunkIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn lock_service(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn DataNodeConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn metadata_store(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Missing backends default to the in-memory ones and the TCP connector.
    pub fn build(self) -> Arc<Manager> {
        let config = self.config;
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(MemoryLockService::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryClusterStore::new()));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.datanode.clone())));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(MemoryMetadata::new()));

        let ctx = Context {
            registry: Arc::new(Registry::new(store, Locker::new(locks, &config.locks))),
            index: self.index.unwrap_or_else(|| Arc::new(MemoryIndex::new())),
            nodes: Arc::new(DataNodes::new(connector)),
            metrics: Arc::new(ManagerMetrics::new()),
        };
        let synchronizer = Arc::new(Synchronizer::new(ctx.clone()));

        Arc::new(Manager {
            health: Arc::new(HealthTracker::new(
                ctx.clone(),
                synchronizer.clone(),
                config.health.clone(),
            )),
            replication: Arc::new(Replication::new(ctx.clone(), config.replication.clone())),
            placement: Placement::new(ctx.clone(), config.placement.clone()),
            balancer: Arc::new(Balancer::new(
                ctx.clone(),
                synchronizer.clone(),
                config.balance.clone(),
            )),
            mover: Arc::new(Mover::new(
                ctx.clone(),
                synchronizer.clone(),
                config.balance.clone(),
            )),
            repair: Arc::new(RepairEngine::new(ctx.clone(), synchronizer.clone(), metadata)),
            snapshots: Snapshots::new(ctx.clone(), synchronizer.clone()),
            operations: Arc::new(OperationTracker::default()),
            synchronizer,
            ctx,
            config,
        })
    }
}

pub struct Manager {
    config: ManagerConfig,
    ctx: Context,
    synchronizer: Arc<Synchronizer>,
    health: Arc<HealthTracker>,
    replication: Arc<Replication>,
    placement: Placement,
    balancer: Arc<Balancer>,
    mover: Arc<Mover>,
    repair: Arc<RepairEngine>,
    snapshots: Snapshots,
    operations: Arc<OperationTracker>,
}

impl Manager {
    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder {
            config,
            store: None,
            index: None,
            locks: None,
            connector: None,
            metadata: None,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.ctx.metrics
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Starts the health loops. They stop when `shutdown` fires.
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let replication = self.replication.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            replication.shutdown();
        });
        self.health.clone().spawn(shutdown)
    }

    // Membership

    async fn identify(&self, address: &str) -> Result<(NodeId, u64)> {
        let node = self.ctx.nodes.get(address);
        let hardware_id = node.hardware_id().await?;
        let size = node.size().await?;
        Ok((Node::derive_id(&hardware_id, address, size), size))
    }

    fn ensure_unregistered(&self, node_id: &str) -> Result<()> {
        match self.ctx.registry.find_by_node(node_id) {
            Ok(owner) => Err(ManagerError::Registered {
                node_id: node_id.to_string(),
                cluster_id: owner.id,
            }),
            Err(ManagerError::NodeNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Forms a cluster from `addresses`; the first one becomes the master.
    pub async fn register_cluster(&self, addresses: &[String]) -> Result<Cluster> {
        let Some(master_address) = addresses.first() else {
            return Err(ManagerError::InvalidRequest("no node address given".into()));
        };
        let unique: HashSet<&String> = addresses.iter().collect();
        if unique.len() != addresses.len() {
            return Err(ManagerError::InvalidRequest("duplicate node address".into()));
        }

        let mut nodes = Vec::with_capacity(addresses.len());
        let mut size = u64::MAX;
        for (i, address) in addresses.iter().enumerate() {
            let (node_id, node_size) = self.identify(address).await?;
            self.ensure_unregistered(&node_id)?;
            size = size.min(node_size);
            nodes.push(Node::new(node_id, address.clone(), i == 0));
        }
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let mut cluster = Cluster::new(cluster_id_for(&ids));
        cluster.size = size;
        cluster.nodes = nodes;

        // The global lock spans the duplicate check, the joins and the insert.
        let mut tx = self.ctx.registry.lock_all().await?;
        tx.ensure_absent(&cluster)?;
        for node in &cluster.nodes {
            let client = self.ctx.nodes.get(&node.address);
            client.join(&cluster.id, &node.id, master_address).await?;
            if node.master {
                client.mode(true).await?;
            }
        }
        tx.insert(cluster.clone());
        tx.commit().await?;
        info!(cluster_id = %cluster.id, nodes = cluster.nodes.len(), size, "cluster registered");

        if let Err(e) = self.synchronizer.cluster(&cluster.id, false, false, false).await {
            warn!(cluster_id = %cluster.id, error = %e, "initial sync failed");
        }
        self.ctx.registry.get(&cluster.id)
    }

    /// Adds a node to an existing cluster as a slave. Its content is wiped and
    /// rebuilt from the master.
    pub async fn register_node(&self, cluster_id: &str, address: &str) -> Result<Node> {
        let (node_id, node_size) = self.identify(address).await?;
        self.ensure_unregistered(&node_id)?;

        let mut tx = self.ctx.registry.lock(cluster_id).await?;
        let master_address = tx
            .master()
            .map(|m| m.address.clone())
            .ok_or_else(|| ManagerError::NoAvailableClusterNode(cluster_id.to_string()))?;
        let client = self.ctx.nodes.get(address);
        client.wipe().await?;
        client.join(cluster_id, &node_id, &master_address).await?;

        let node = Node::new(node_id, address, false);
        tx.nodes.push(node.clone());
        tx.size = tx.size.min(node_size);
        tx.sort_nodes();
        tx.commit().await?;
        info!(cluster_id, node = %node.id, address, "node registered");

        self.synchronizer.queue_cluster(cluster_id);
        Ok(node)
    }

    pub async fn unregister_cluster(&self, cluster_id: &str) -> Result<()> {
        let tx = self.ctx.registry.lock(cluster_id).await?;
        if tx.frozen && tx.used > 0 {
            return Err(ManagerError::NotAvailableForClusterAction(cluster_id.to_string()));
        }
        for node in &tx.nodes {
            if let Err(e) = self.ctx.nodes.get(&node.address).leave().await {
                warn!(cluster_id, node = %node.id, error = %e, "leave failed");
            }
        }
        tx.delete().await?;
        self.ctx.index.remove_cluster(cluster_id)?;
        self.replication.drop_pool(cluster_id);
        info!(cluster_id, "cluster unregistered");
        Ok(())
    }

    pub async fn unregister_node(&self, node_id: &str) -> Result<()> {
        let cluster = self.ctx.registry.find_by_node(node_id)?;
        if cluster.nodes.len() <= 1 {
            return Err(ManagerError::LastNode(node_id.to_string()));
        }
        let was_master = cluster.node(node_id).is_some_and(|n| n.master);
        if was_master {
            self.synchronizer.cluster(&cluster.id, false, false, true).await?;
        }

        let mut tx = self.ctx.registry.lock(&cluster.id).await?;
        let Some(position) = tx.nodes.iter().position(|n| n.id == node_id) else {
            return Err(ManagerError::NodeNotFound(node_id.to_string()));
        };
        if tx.nodes.len() <= 1 {
            return Err(ManagerError::LastNode(node_id.to_string()));
        }
        let removed = tx.nodes.remove(position);
        if removed.master {
            let successor = tx
                .best_node(None)
                .or_else(|| tx.nodes.first())
                .map(|n| n.id.clone());
            if let Some(successor) = successor {
                tx.set_master(&successor);
            }
        }
        let cluster = tx.commit().await?;

        if let Err(e) = self.ctx.nodes.get(&removed.address).leave().await {
            warn!(cluster_id = %cluster.id, node = %removed.id, error = %e, "leave failed");
        }
        if let Some(master) = cluster.master().filter(|_| removed.master) {
            self.ctx.nodes.get(&master.address).mode(true).await?;
            for node in cluster.slaves() {
                if let Err(e) = self
                    .ctx
                    .nodes
                    .get(&node.address)
                    .join(&cluster.id, &node.id, &master.address)
                    .await
                {
                    warn!(cluster_id = %cluster.id, node = %node.id, error = %e, "join failed");
                }
            }
            info!(cluster_id = %cluster.id, new_master = %master.id, "master handed over");
        }
        info!(cluster_id = %cluster.id, node = node_id, "node unregistered");
        Ok(())
    }

    /// Freezes the given clusters, or all of them when `cluster_ids` is empty.
    pub async fn freeze(&self, cluster_ids: &[ClusterId]) -> Result<()> {
        let ids = self.targets(cluster_ids)?;
        self.ctx.registry.set_frozen(&ids, true).await
    }

    pub async fn unfreeze(&self, cluster_ids: &[ClusterId]) -> Result<()> {
        let ids = self.targets(cluster_ids)?;
        self.ctx.registry.set_frozen(&ids, false).await
    }

    fn targets(&self, cluster_ids: &[ClusterId]) -> Result<Vec<ClusterId>> {
        if cluster_ids.is_empty() {
            self.ctx.registry.ids()
        } else {
            Ok(cluster_ids.to_vec())
        }
    }

    pub async fn change_state(&self, cluster_id: &str, state: ClusterState) -> Result<()> {
        let mut tx = self.ctx.registry.lock(cluster_id).await?;
        tx.state = state;
        tx.commit().await?;
        info!(cluster_id, ?state, "cluster state changed");
        Ok(())
    }

    pub fn clusters(&self) -> Result<Vec<Cluster>> {
        self.ctx.registry.get_all()
    }

    pub fn cluster(&self, cluster_id: &str) -> Result<Cluster> {
        self.ctx.registry.get(cluster_id)
    }

    pub fn health(&self) -> Result<Vec<ClusterHealth>> {
        self.health.report()
    }

    /// Runs one probe round over every cluster.
    pub async fn check_health(&self) {
        self.health.check_all().await
    }

    // Node-facing

    pub fn handshake(&self, address: &str) -> Result<Handshake> {
        let cluster = self.ctx.registry.find_by_address(address)?;
        let node = cluster
            .node_by_address(address)
            .ok_or_else(|| ManagerError::NodeNotFound(address.to_string()))?;
        let master = cluster
            .master()
            .ok_or_else(|| ManagerError::NoAvailableClusterNode(cluster.id.clone()))?;
        Ok(Handshake {
            cluster_id: cluster.id.clone(),
            node_id: node.id.clone(),
            master_address: master.address.clone(),
        })
    }

    pub async fn notify(&self, events: Vec<NodeEvent>) -> Result<()> {
        self.replication.notify(events).await
    }

    // Placement

    pub async fn reserve(&self, size: u64) -> Result<ReservationMap> {
        self.placement.reserve(size).await
    }

    pub async fn commit(&self, reservation_id: &str, written: &HashMap<ClusterId, u64>) -> Result<()> {
        self.placement.commit(reservation_id, written).await
    }

    pub async fn discard(&self, reservation_id: &str) -> Result<()> {
        self.placement.discard(reservation_id).await
    }

    pub fn find(&self, hash: &ChunkHash, map_type: MapType) -> Result<ChunkLocation> {
        self.placement.find(hash, map_type)
    }

    pub fn placement_map(
        &self,
        hashes: &[ChunkHash],
        map_type: MapType,
    ) -> Result<BTreeMap<ChunkHash, ChunkLocation>> {
        self.placement.placement_map(hashes, map_type)
    }

    // Background operations

    /// Starts a sync of one cluster, or of every cluster.
    pub fn sync(&self, cluster_id: Option<&str>, force: bool) -> Result<OperationId> {
        let synchronizer = self.synchronizer.clone();
        match cluster_id {
            Some(id) => {
                self.ctx.registry.get(id)?;
                let target = id.to_string();
                Ok(self.operations.spawn("sync", id, async move {
                    synchronizer.cluster(&target, force, false, true).await
                }))
            }
            None => Ok(self
                .operations
                .spawn("sync", "*", async move { synchronizer.all(force).await })),
        }
    }

    /// True while a background sync of the cluster is queued or running.
    pub fn sync_queued(&self, cluster_id: &str) -> bool {
        self.synchronizer.is_queued(cluster_id)
    }

    pub async fn repair(&self, repair_type: RepairType) -> Result<OperationId> {
        if self.repair.is_running().await? {
            return Err(ManagerError::Processing);
        }
        let repair = self.repair.clone();
        let target = format!("{repair_type:?}").to_lowercase();
        Ok(self.operations.spawn("repair", &target, async move {
            repair.run(repair_type).await.map(|_| ())
        }))
    }

    pub async fn repair_status(&self) -> Result<RepairStatus> {
        Ok(RepairStatus {
            running: self.repair.is_running().await?,
            detail: self.repair.status()?,
        })
    }

    pub fn balance(&self, cluster_ids: &[ClusterId]) -> Result<OperationId> {
        self.balancer.validate(cluster_ids)?;
        let balancer = self.balancer.clone();
        let ids = cluster_ids.to_vec();
        let target = if ids.is_empty() { "*".to_string() } else { ids.join(",") };
        Ok(self.operations.spawn("balance", &target, async move {
            balancer.balance(&ids).await.map(|_| ())
        }))
    }

    pub fn move_cluster(&self, source_id: &str, target_id: &str) -> Result<OperationId> {
        if source_id == target_id {
            return Err(ManagerError::InvalidRequest(
                "source and target cluster are the same".into(),
            ));
        }
        for id in [source_id, target_id] {
            let cluster = self.ctx.registry.get(id)?;
            if cluster.frozen && cluster.used > 0 {
                return Err(ManagerError::NotAvailableForClusterAction(id.to_string()));
            }
        }
        let mover = self.mover.clone();
        let (source, target) = (source_id.to_string(), target_id.to_string());
        Ok(self
            .operations
            .spawn("move", &format!("{source_id}->{target_id}"), async move {
                mover.move_cluster(&source, &target).await.map(|_| ())
            }))
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.operations.list()
    }

    pub fn operation(&self, id: OperationId) -> Option<Operation> {
        self.operations.get(id)
    }

    // Snapshots

    pub async fn snapshot_create(&self, cluster_id: &str) -> Result<DateTime<Utc>> {
        self.snapshots.create(cluster_id).await
    }

    pub async fn snapshot_delete(&self, cluster_id: &str, index: u64) -> Result<()> {
        self.snapshots.delete(cluster_id, index).await
    }

    pub async fn snapshot_restore(&self, cluster_id: &str, index: u64) -> Result<()> {
        self.snapshots.restore(cluster_id, index).await
    }
}
