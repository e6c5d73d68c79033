//! Node liveness probing and master failover.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::context::Context;
use crate::error::Result;
use crate::synchronizer::Synchronizer;
use crate::types::{Cluster, ChunkHash, Node, NodeId, QUALITY_UNREACHABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Master answers but some slaves do not.
    Degraded,
    /// No reachable master could be established.
    Paralyzed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_id: String,
    pub status: HealthStatus,
    pub node_count: usize,
    pub reachable_nodes: usize,
    pub frozen: bool,
}

impl ClusterHealth {
    pub fn of(cluster: &Cluster) -> Self {
        let reachable_nodes = cluster.nodes.iter().filter(|n| n.is_reachable()).count();
        let master_ok = cluster.master().is_some_and(|m| m.is_reachable());
        let status = if cluster.paralyzed || !master_ok {
            HealthStatus::Paralyzed
        } else if reachable_nodes < cluster.nodes.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            cluster_id: cluster.id.clone(),
            status,
            node_count: cluster.nodes.len(),
            reachable_nodes,
            frozen: cluster.frozen,
        }
    }
}

pub struct HealthTracker {
    ctx: Context,
    synchronizer: Arc<Synchronizer>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(ctx: Context, synchronizer: Arc<Synchronizer>, config: HealthConfig) -> Self {
        Self {
            ctx,
            synchronizer,
            config,
        }
    }

    async fn probe(&self, node: &Node) -> i64 {
        match self.ctx.nodes.get(&node.address).ping().await {
            Ok(latency) => latency.max(0),
            Err(e) => {
                debug!(node = %node.id, address = %node.address, error = %e, "probe failed");
                QUALITY_UNREACHABLE
            }
        }
    }

    /// Probes every node of a cluster and fails the master over when needed.
    ///
    /// Probes and the election talk to the nodes without holding the cluster
    /// lock; the lock is taken only to persist the outcome.
    pub async fn check_cluster(&self, cluster_id: &str) -> Result<()> {
        let mut cluster = self.ctx.registry.get(cluster_id)?;
        let probes = join_all(
            cluster
                .nodes
                .iter()
                .map(|node| async move { (node.id.clone(), self.probe(node).await) }),
        )
        .await;
        for (node_id, quality) in &probes {
            if let Some(node) = cluster.node_mut(node_id) {
                node.quality = *quality;
            }
        }

        let master_down = !cluster.master().is_some_and(|m| m.is_reachable());
        let elected = if master_down && !cluster.frozen {
            self.elect(&cluster).await
        } else {
            None
        };
        let seen_master: Option<NodeId> = cluster.master().map(|m| m.id.clone());

        let mut tx = self.ctx.registry.lock(cluster_id).await?;
        for (node_id, quality) in probes {
            if let Some(node) = tx.node_mut(&node_id) {
                node.quality = quality;
            }
        }
        tx.sort_nodes();

        let current_master: Option<NodeId> = tx.master().map(|m| m.id.clone());
        if tx.frozen || current_master != seen_master {
            if let Some(candidate) = &elected {
                self.demote(cluster_id, candidate).await;
            }
            tx.commit().await?;
            return Ok(());
        }

        if !master_down {
            if tx.paralyzed {
                info!(cluster_id, "master reachable again, cluster recovered");
            }
            tx.paralyzed = false;
            tx.commit().await?;
            return Ok(());
        }

        let Some(candidate) = elected.filter(|c| tx.node(&c.id).is_some()) else {
            if !tx.paralyzed {
                warn!(cluster_id, "no node qualifies as master, cluster paralyzed");
            }
            tx.paralyzed = true;
            tx.commit().await?;
            return Ok(());
        };

        tx.set_master(&candidate.id);
        tx.paralyzed = false;
        let cluster = tx.commit().await?;
        self.ctx.metrics.failovers_total.inc();
        warn!(
            cluster_id,
            old_master = ?seen_master,
            new_master = %candidate.id,
            "master failed over"
        );

        for node in cluster.nodes.iter().filter(|n| n.id != candidate.id) {
            if let Err(e) = self
                .ctx
                .nodes
                .get(&node.address)
                .join(cluster_id, &node.id, &candidate.address)
                .await
            {
                debug!(cluster_id, node = %node.id, error = %e, "join after failover failed");
            }
        }
        Ok(())
    }

    /// Picks the best reachable slave holding every indexed chunk and switches
    /// it to master mode.
    async fn elect(&self, cluster: &Cluster) -> Option<Node> {
        let mut candidates: Vec<&Node> = cluster
            .nodes
            .iter()
            .filter(|n| !n.master && n.is_reachable())
            .collect();
        candidates.sort_by_key(|n| n.quality);

        for candidate in candidates {
            if !self.is_complete(&cluster.id, candidate).await {
                continue;
            }
            match self.ctx.nodes.get(&candidate.address).mode(true).await {
                Ok(()) => return Some(candidate.clone()),
                Err(e) => {
                    warn!(cluster_id = %cluster.id, node = %candidate.id, error = %e, "promotion refused")
                }
            }
        }
        None
    }

    async fn demote(&self, cluster_id: &str, candidate: &Node) {
        debug!(cluster_id, node = %candidate.id, "cluster changed during election, promotion withdrawn");
        if let Err(e) = self.ctx.nodes.get(&candidate.address).mode(false).await {
            warn!(cluster_id, node = %candidate.id, error = %e, "demotion failed");
        }
    }

    /// True when the node holds every chunk the index records for the cluster.
    async fn is_complete(&self, cluster_id: &str, node: &Node) -> bool {
        let listing = match self.ctx.nodes.get(&node.address).sync_list(None).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!(cluster_id, node = %node.id, error = %e, "candidate listing failed");
                return false;
            }
        };
        let held: HashSet<ChunkHash> = listing.hashes().into_iter().collect();
        match self.ctx.index.compare(cluster_id, &held) {
            Ok(missing) if missing.is_empty() => true,
            Ok(missing) => {
                debug!(cluster_id, node = %node.id, missing = missing.len(), "candidate is behind");
                false
            }
            Err(e) => {
                warn!(cluster_id, error = %e, "index compare failed");
                false
            }
        }
    }

    pub async fn check_all(&self) {
        let ids = match self.ctx.registry.ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "cannot list clusters for health check");
                return;
            }
        };
        let checks = ids.iter().map(|id| async move {
            if let Err(e) = self.check_cluster(id).await {
                warn!(cluster_id = %id, error = %e, "health check failed");
            }
        });
        join_all(checks).await;
        if let Ok(clusters) = self.ctx.registry.get_all() {
            self.ctx.metrics.observe_clusters(&clusters);
        }
    }

    /// Queues a resync of every cluster that is not frozen.
    pub fn maintain(&self) -> Result<usize> {
        let mut queued = 0;
        for cluster in self.ctx.registry.get_all()? {
            if cluster.frozen {
                continue;
            }
            if self.synchronizer.queue_cluster(&cluster.id) {
                queued += 1;
            }
        }
        info!(queued, "maintenance sync queued");
        Ok(queued)
    }

    pub fn report(&self) -> Result<Vec<ClusterHealth>> {
        Ok(self
            .ctx
            .registry
            .get_all()?
            .iter()
            .map(ClusterHealth::of)
            .collect())
    }

    /// Runs the probe loop and the maintenance loop until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let check_every = self.config.check_interval();
            let maintain_every = self.config.maintain_interval();
            let mut check = interval_at(Instant::now() + check_every, check_every);
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut maintain = interval_at(Instant::now() + maintain_every, maintain_every);
            maintain.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = check.tick() => self.check_all().await,
                    _ = maintain.tick() => {
                        if let Err(e) = self.maintain() {
                            warn!(error = %e, "maintenance pass failed");
                        }
                    }
                }
            }
            info!("health tracker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use std::time::Duration;

    fn tracker(h: &Harness) -> HealthTracker {
        let sync = Arc::new(Synchronizer::new(h.ctx.clone()));
        HealthTracker::new(h.ctx.clone(), sync, HealthConfig::default())
    }

    #[tokio::test]
    async fn healthy_master_refreshes_quality() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "s1", "s2"], 100).await;
        sims[1].set_latency(9);
        sims[2].set_latency(3);
        tracker(&h).check_cluster("c1").await.unwrap();

        let cluster = h.cluster_record("c1");
        let order: Vec<&str> = cluster.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(order, vec!["m", "s2", "s1"]);
        assert!(!cluster.paralyzed);
        assert_eq!(ClusterHealth::of(&cluster).status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn failover_promotes_complete_replica() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "behind", "full"], 100).await;
        let hash = sims[0].put(b"data");
        sims[2].put(b"data");
        h.ctx.index.add("c1", hash, 4, 1, Some("m")).unwrap();
        sims[1].set_latency(1);
        sims[2].set_latency(5);
        sims[0].set_alive(false);

        tracker(&h).check_cluster("c1").await.unwrap();

        let cluster = h.cluster_record("c1");
        assert_eq!(cluster.master().unwrap().id, "full");
        assert_eq!(cluster.nodes.iter().filter(|n| n.master).count(), 1);
        assert!(!cluster.paralyzed);
        assert!(sims[2].is_master());
        assert_eq!(sims[1].master_address().as_deref(), Some("full"));
        assert_eq!(h.ctx.metrics.failovers_total.get(), 1);
        assert_eq!(ClusterHealth::of(&cluster).status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn no_candidate_paralyzes_and_keeps_master() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "s"], 100).await;
        let hash = sims[0].put(b"only on master");
        h.ctx.index.add("c1", hash, 14, 1, Some("m")).unwrap();
        sims[0].set_alive(false);

        tracker(&h).check_cluster("c1").await.unwrap();

        let cluster = h.cluster_record("c1");
        assert!(cluster.paralyzed);
        assert_eq!(cluster.master().unwrap().id, "m");
        assert!(!cluster.writable());

        sims[0].set_alive(true);
        tracker(&h).check_cluster("c1").await.unwrap();
        assert!(!h.cluster_record("c1").paralyzed);
    }

    #[tokio::test]
    async fn frozen_cluster_only_updates_quality() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "s"], 100).await;
        h.ctx.registry.freeze("c1").await.unwrap();
        sims[0].set_alive(false);

        tracker(&h).check_cluster("c1").await.unwrap();

        let cluster = h.cluster_record("c1");
        assert_eq!(cluster.master().unwrap().id, "m");
        assert!(!cluster.master().unwrap().is_reachable());
        assert!(!cluster.paralyzed);
    }

    #[tokio::test]
    async fn maintain_skips_frozen_clusters() {
        let h = Harness::new();
        h.cluster("a", &["a1"], 100).await;
        h.cluster("b", &["b1"], 100).await;
        h.ctx.registry.freeze("b").await.unwrap();
        assert_eq!(tracker(&h).maintain().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ping_leaves_cluster_unlocked() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "s"], 100).await;
        sims[0].set_latency(5_000);
        let tracker = Arc::new(tracker(&h));
        let check = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.check_cluster("c1").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!check.is_finished());

        let tx = tokio::time::timeout(Duration::from_millis(100), h.ctx.registry.lock("c1"))
            .await
            .expect("cluster lock taken during the health check")
            .unwrap();
        tx.commit().await.unwrap();

        check.await.unwrap().unwrap();
        assert_eq!(h.cluster_record("c1").master().unwrap().quality, 5_000);
    }

    #[tokio::test]
    async fn withdrawn_promotion_returns_node_to_slave() {
        let h = Harness::new();
        let sims = h.cluster("c1", &["m", "s"], 100).await;
        let mut cluster = h.cluster_record("c1");
        cluster.node_mut("m").unwrap().quality = QUALITY_UNREACHABLE;
        let tracker = tracker(&h);

        let elected = tracker.elect(&cluster).await.unwrap();
        assert_eq!(elected.id, "s");
        assert!(sims[1].is_master());

        tracker.demote("c1", &elected).await;
        assert!(!sims[1].is_master());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let h = Harness::new();
        h.cluster("c1", &["m"], 100).await;
        let shutdown = CancellationToken::new();
        let handle = Arc::new(tracker(&h)).spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(h.ctx.metrics.clusters_total.get(), 1);
    }
}
