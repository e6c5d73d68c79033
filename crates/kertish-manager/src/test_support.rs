use std::sync::Arc;

use crate::config::LockConfig;
use crate::context::Context;
use crate::datanode::{DataNode, DataNodes};
use crate::index::MemoryIndex;
use crate::locks::{Locker, MemoryLockService};
use crate::metrics::ManagerMetrics;
use crate::error::Result;
use crate::registry::{MemoryClusterStore, Registry};
use crate::sim::{SimDataNode, SimNetwork};
use crate::types::{Cluster, Node};

pub(crate) struct Harness {
    pub network: SimNetwork,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        let network = SimNetwork::new();
        let config = LockConfig {
            lease_ttl_ms: 2000,
            poll_interval_ms: 1,
        };
        let locker = Locker::new(Arc::new(MemoryLockService::new()), &config);
        let ctx = Context {
            registry: Arc::new(Registry::new(Arc::new(MemoryClusterStore::new()), locker)),
            index: Arc::new(MemoryIndex::new()),
            nodes: Arc::new(DataNodes::new(Arc::new(network.clone()))),
            metrics: Arc::new(ManagerMetrics::new()),
        };
        Self { network, ctx }
    }

    /// Registers a cluster of simulated nodes. The first address is the master
    /// and node ids equal addresses.
    pub async fn cluster(&self, id: &str, addresses: &[&str], size: u64) -> Vec<Arc<SimDataNode>> {
        let sims: Vec<Arc<SimDataNode>> = addresses
            .iter()
            .map(|a| self.network.add_node(a, &format!("hw-{a}"), size))
            .collect();
        let mut cluster = Cluster::new(id);
        cluster.size = size;
        cluster.nodes = addresses
            .iter()
            .enumerate()
            .map(|(i, a)| Node::new(a.to_string(), *a, i == 0))
            .collect();
        for (i, sim) in sims.iter().enumerate() {
            sim.join(id, addresses[i], addresses[0]).await.unwrap();
        }
        register(&self.ctx.registry, cluster).await.unwrap();
        sims
    }

    pub fn cluster_record(&self, id: &str) -> Cluster {
        self.ctx.registry.get(id).unwrap()
    }
}

/// Adds a cluster record the way registration does, without node calls.
pub async fn register(registry: &Registry, cluster: Cluster) -> Result<()> {
    let mut tx = registry.lock_all().await?;
    tx.ensure_absent(&cluster)?;
    tx.insert(cluster);
    tx.commit().await
}
