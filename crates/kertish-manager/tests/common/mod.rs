//! Shared fixtures: a manager wired to an in-process data node network.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kertish_manager::metadata::MemoryMetadata;
use kertish_manager::operations::{Operation, OperationId};
use kertish_manager::sim::{SimDataNode, SimNetwork};
use kertish_manager::{Cluster, Manager, ManagerConfig};

pub struct TestEnv {
    pub network: SimNetwork,
    pub metadata: Arc<MemoryMetadata>,
    pub manager: Arc<Manager>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut ManagerConfig)) -> Self {
        let mut config = ManagerConfig::default();
        config.locks.poll_interval_ms = 1;
        tweak(&mut config);
        let network = SimNetwork::new();
        let metadata = Arc::new(MemoryMetadata::new());
        let manager = Manager::builder(config)
            .connector(Arc::new(network.clone()))
            .metadata_store(metadata.clone())
            .build();
        Self {
            network,
            metadata,
            manager,
        }
    }

    /// Brings nodes online and registers them as one cluster, first address
    /// as master.
    pub async fn cluster(&self, addresses: &[&str], size: u64) -> (Cluster, Vec<Arc<SimDataNode>>) {
        let sims = self.nodes(addresses, size);
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        let cluster = self.manager.register_cluster(&addresses).await.unwrap();
        (cluster, sims)
    }

    pub fn nodes(&self, addresses: &[&str], size: u64) -> Vec<Arc<SimDataNode>> {
        addresses
            .iter()
            .map(|a| self.network.add_node(a, &format!("hw-{a}"), size))
            .collect()
    }

    pub fn record(&self, cluster_id: &str) -> Cluster {
        self.manager.cluster(cluster_id).unwrap()
    }

    /// Starts a sync of one cluster and waits for it.
    pub async fn sync(&self, cluster_id: &str) -> Operation {
        let op = self.manager.sync(Some(cluster_id), true).unwrap();
        self.wait(op).await
    }

    /// Waits until no background sync of the cluster is pending.
    pub async fn settle(&self, cluster_id: &str) {
        for _ in 0..1000 {
            if !self.manager.sync_queued(cluster_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sync of {cluster_id} never settled");
    }

    pub async fn wait(&self, op: OperationId) -> Operation {
        for _ in 0..1000 {
            if let Some(done) = self.manager.operation(op).filter(|o| o.is_terminal()) {
                return done;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation {op} did not finish");
    }
}

pub fn master_count(cluster: &Cluster) -> usize {
    cluster.nodes.iter().filter(|n| n.master).count()
}
