//! Replica propagation.
//!
//! Data nodes report chunk creations and deletions; each event is recorded in
//! the index and turned into a job that copies or removes the chunk on every
//! sibling node. Every cluster gets its own lazily created pool: a bounded
//! queue, a fixed number of concurrent jobs and a delay queue holding jobs
//! that wait for their next attempt.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::context::Context;
use crate::error::{ManagerError, Result};
use crate::types::{ChunkHash, ClusterId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Delete,
}

/// A chunk change reported by a data node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    /// Address of the reporting node.
    pub source: String,
    pub hash: ChunkHash,
    pub size: u64,
    /// Reference count on the source after the change.
    pub usage: u16,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
struct Target {
    node_id: NodeId,
    address: String,
    remaining: u8,
    completed: bool,
}

#[derive(Debug, Clone)]
pub struct Job {
    cluster_id: ClusterId,
    hash: ChunkHash,
    size: u64,
    source: String,
    kind: EventKind,
    targets: Vec<Target>,
}

impl Job {
    fn pending(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(|t| !t.completed)
    }
}

pub struct Replication {
    ctx: Context,
    config: ReplicationConfig,
    pools: DashMap<ClusterId, mpsc::Sender<Job>>,
    shutdown: CancellationToken,
}

impl Replication {
    pub fn new(ctx: Context, config: ReplicationConfig) -> Self {
        Self {
            ctx,
            config,
            pools: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Records node events in the index and queues propagation to siblings.
    pub async fn notify(self: &Arc<Self>, events: Vec<NodeEvent>) -> Result<()> {
        let mut failures = Vec::new();
        for event in events {
            if let Err(e) = self.apply(event.clone()).await {
                warn!(source = %event.source, hash = %event.hash, error = %e, "node event rejected");
                failures.push(format!("{}: {e}", event.hash));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Bulk(failures))
        }
    }

    async fn apply(self: &Arc<Self>, event: NodeEvent) -> Result<()> {
        let cluster = self.ctx.registry.find_by_address(&event.source)?;
        let source = cluster
            .node_by_address(&event.source)
            .ok_or_else(|| ManagerError::NodeNotFound(event.source.clone()))?;

        let kind = match event.kind {
            EventKind::Create => {
                self.ctx
                    .index
                    .add(&cluster.id, event.hash, event.size, event.usage, Some(&source.id))?;
                EventKind::Create
            }
            EventKind::Delete if event.usage == 0 => {
                self.ctx.index.remove(&cluster.id, &event.hash)?;
                EventKind::Delete
            }
            EventKind::Delete => {
                // Still referenced: siblings mirror the source's new count.
                self.ctx
                    .index
                    .add(&cluster.id, event.hash, event.size, event.usage, None)?;
                EventKind::Create
            }
        };

        let targets: Vec<Target> = cluster
            .nodes
            .iter()
            .filter(|n| n.id != source.id)
            .map(|n| Target {
                node_id: n.id.clone(),
                address: n.address.clone(),
                remaining: self.config.retries.max(1),
                completed: false,
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        self.enqueue(Job {
            cluster_id: cluster.id.clone(),
            hash: event.hash,
            size: event.size,
            source: event.source,
            kind,
            targets,
        })
        .await
    }

    /// Queues a job, waiting while the cluster's queue is full.
    pub async fn enqueue(self: &Arc<Self>, job: Job) -> Result<()> {
        let cluster_id = job.cluster_id.clone();
        self.pool(&cluster_id)
            .send(job)
            .await
            .map_err(|_| ManagerError::NotAvailableForClusterAction(cluster_id))?;
        self.ctx.metrics.replication_jobs_total.inc();
        Ok(())
    }

    fn pool(self: &Arc<Self>, cluster_id: &str) -> mpsc::Sender<Job> {
        self.pools
            .entry(cluster_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
                tokio::spawn(Arc::clone(self).run_pool(cluster_id.to_string(), rx));
                debug!(cluster_id, "replication pool started");
                tx
            })
            .clone()
    }

    /// Stops accepting jobs for a cluster; the pool exits once drained.
    pub fn drop_pool(&self, cluster_id: &str) {
        self.pools.remove(cluster_id);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run_pool(self: Arc<Self>, cluster_id: ClusterId, mut queue: mpsc::Receiver<Job>) {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut delayed: DelayQueue<Job> = DelayQueue::new();
        let (retry_tx, mut retries) = mpsc::unbounded_channel::<Job>();

        loop {
            let job = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                Some(job) = retries.recv() => {
                    delayed.insert(job, self.config.cooldown());
                    continue;
                }
                Some(expired) = delayed.next() => expired.into_inner(),
            };

            let permit = match Arc::clone(&slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = Arc::clone(&self);
            let retry_tx = retry_tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Some(job) = this.process(job).await {
                    let _ = retry_tx.send(job);
                }
            });
        }

        if !delayed.is_empty() {
            warn!(cluster_id = %cluster_id, jobs = delayed.len(), "replication pool stopped with delayed jobs");
        }
        debug!(cluster_id = %cluster_id, "replication pool stopped");
    }

    /// Runs one attempt. Returns the job when it has to be tried again.
    async fn process(&self, mut job: Job) -> Option<Job> {
        let cluster = match self.ctx.registry.get(&job.cluster_id) {
            Ok(cluster) => cluster,
            Err(_) => {
                self.abandon(&job, "cluster unregistered");
                return None;
            }
        };
        if cluster.paralyzed {
            self.abandon(&job, "cluster paralyzed");
            return None;
        }

        let attempts = job.pending().map(|target| {
            let node = self.ctx.nodes.get(&target.address);
            let (hash, source, kind) = (job.hash, job.source.clone(), job.kind);
            let node_id = target.node_id.clone();
            async move {
                let outcome = match kind {
                    EventKind::Create => node.sync_create(&hash, &source).await,
                    EventKind::Delete => node.sync_delete(&hash).await,
                };
                (node_id, outcome)
            }
        });
        let outcomes = join_all(attempts).await;

        for (node_id, outcome) in outcomes {
            let Some(target) = job.targets.iter_mut().find(|t| t.node_id == node_id) else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    target.completed = true;
                    if job.kind == EventKind::Create {
                        if let Err(e) =
                            self.ctx
                                .index
                                .mark_holder(&job.cluster_id, &[job.hash], &node_id)
                        {
                            warn!(cluster_id = %job.cluster_id, error = %e, "holder update failed");
                        }
                    }
                }
                Err(e) => {
                    target.remaining = target.remaining.saturating_sub(1);
                    debug!(
                        cluster_id = %job.cluster_id,
                        node = %node_id,
                        hash = %job.hash,
                        remaining = target.remaining,
                        error = %e,
                        "replication attempt failed"
                    );
                }
            }
        }

        if job.pending().next().is_none() {
            debug!(cluster_id = %job.cluster_id, hash = %job.hash, size = job.size, "replicated");
            return None;
        }
        if job.pending().any(|t| t.remaining == 0) {
            self.abandon(&job, "retries exhausted");
            return None;
        }
        self.ctx.metrics.replication_retries_total.inc();
        Some(job)
    }

    fn abandon(&self, job: &Job, reason: &str) {
        self.ctx.metrics.replication_abandoned_total.inc();
        let pending: Vec<&str> = job.pending().map(|t| t.node_id.as_str()).collect();
        info!(
            cluster_id = %job.cluster_id,
            hash = %job.hash,
            kind = ?job.kind,
            pending = ?pending,
            reason,
            "replication job abandoned"
        );
    }
}
