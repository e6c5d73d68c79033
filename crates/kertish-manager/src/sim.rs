//! In-process data node network for tests and local experiments.
//!
//! [`SimNetwork`] implements [`DataNodeConnector`] by handing out
//! [`SimDataNode`]s that keep their chunks in memory. Nodes find each other
//! through the network for node-to-node transfers, and can be taken offline,
//! slowed down or made to fail transfers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::datanode::{DataNode, DataNodeConnector};
use crate::error::{ManagerError, Result};
use crate::types::{ChunkHash, SyncContainer, SyncFileItem};

type Peers = DashMap<String, Arc<SimDataNode>>;

#[derive(Debug, Clone)]
struct StoredChunk {
    data: Bytes,
    usage: u16,
}

type ChunkMap = BTreeMap<ChunkHash, StoredChunk>;

#[derive(Default)]
struct SimState {
    hardware_id: String,
    size: u64,
    chunks: ChunkMap,
    snapshots: Vec<(DateTime<Utc>, ChunkMap)>,
    master: bool,
    cluster_id: Option<String>,
    master_address: Option<String>,
}

/// Simulated storage node.
pub struct SimDataNode {
    address: String,
    peers: Weak<Peers>,
    alive: AtomicBool,
    latency_ms: AtomicI64,
    fail_transfers: AtomicBool,
    state: Mutex<SimState>,
}

impl SimDataNode {
    fn new(address: &str, peers: Weak<Peers>, alive: bool) -> Self {
        Self {
            address: address.to_string(),
            peers,
            alive: AtomicBool::new(alive),
            latency_ms: AtomicI64::new(1),
            fail_transfers: AtomicBool::new(false),
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ManagerError::data_node(&self.address, "connection refused"))
        }
    }

    fn check_transfer(&self) -> Result<()> {
        self.check()?;
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(ManagerError::data_node(&self.address, "transfer failed"));
        }
        Ok(())
    }

    fn peer(&self, address: &str) -> Result<Arc<SimDataNode>> {
        let peer = self
            .peers
            .upgrade()
            .and_then(|peers| peers.get(address).map(|p| p.clone()))
            .ok_or_else(|| ManagerError::data_node(address, "unknown peer"))?;
        peer.check()?;
        Ok(peer)
    }

    fn chunk_from(&self, hash: &ChunkHash, source_address: &str) -> Result<StoredChunk> {
        self.peer(source_address)?
            .state()
            .chunks
            .get(hash)
            .cloned()
            .ok_or_else(|| ManagerError::data_node(source_address, format!("chunk {hash} missing")))
    }

    /// Stores content directly, bypassing the manager.
    pub fn put(&self, data: &[u8]) -> ChunkHash {
        let hash = ChunkHash::of(data);
        let mut state = self.state();
        let chunk = state.chunks.entry(hash).or_insert_with(|| StoredChunk {
            data: Bytes::copy_from_slice(data),
            usage: 0,
        });
        chunk.usage = chunk.usage.saturating_add(1);
        hash
    }

    pub fn chunks(&self) -> Vec<ChunkHash> {
        self.state().chunks.keys().copied().collect()
    }

    pub fn has(&self, hash: &ChunkHash) -> bool {
        self.state().chunks.contains_key(hash)
    }

    pub fn usage(&self, hash: &ChunkHash) -> Option<u16> {
        self.state().chunks.get(hash).map(|c| c.usage)
    }

    pub fn used_bytes(&self) -> u64 {
        self.state().chunks.values().map(|c| c.data.len() as u64).sum()
    }

    pub fn is_master(&self) -> bool {
        self.state().master
    }

    pub fn master_address(&self) -> Option<String> {
        self.state().master_address.clone()
    }

    pub fn cluster_id(&self) -> Option<String> {
        self.state().cluster_id.clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state().snapshots.len()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_latency(&self, ms: i64) {
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Makes node-to-node pulls into this node fail.
    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataNode for SimDataNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn create(&self, data: Bytes) -> Result<ChunkHash> {
        self.check()?;
        Ok(self.put(&data))
    }

    async fn read(&self, hash: &ChunkHash) -> Result<Bytes> {
        self.check()?;
        self.state()
            .chunks
            .get(hash)
            .map(|c| c.data.clone())
            .ok_or(ManagerError::ChunkNotFound(*hash))
    }

    async fn delete(&self, hash: &ChunkHash) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        let chunk = state
            .chunks
            .get_mut(hash)
            .ok_or(ManagerError::ChunkNotFound(*hash))?;
        chunk.usage = chunk.usage.saturating_sub(1);
        if chunk.usage == 0 {
            state.chunks.remove(hash);
        }
        Ok(())
    }

    async fn hardware_id(&self) -> Result<String> {
        self.check()?;
        Ok(self.state().hardware_id.clone())
    }

    async fn join(&self, cluster_id: &str, _node_id: &str, master_address: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        state.cluster_id = Some(cluster_id.to_string());
        state.master = master_address == self.address;
        state.master_address = Some(master_address.to_string());
        Ok(())
    }

    async fn mode(&self, master: bool) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        state.master = master;
        if master {
            state.master_address = Some(self.address.clone());
        }
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        state.cluster_id = None;
        state.master = false;
        state.master_address = None;
        Ok(())
    }

    async fn wipe(&self) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        state.chunks.clear();
        state.snapshots.clear();
        Ok(())
    }

    async fn snapshot_create(&self) -> Result<DateTime<Utc>> {
        self.check()?;
        let mut state = self.state();
        let taken = Utc::now();
        let chunks = state.chunks.clone();
        state.snapshots.push((taken, chunks));
        Ok(taken)
    }

    async fn snapshot_delete(&self, index: u64) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        let index = usize::try_from(index).unwrap_or(usize::MAX);
        if index >= state.snapshots.len() {
            return Err(ManagerError::data_node(&self.address, "no such snapshot"));
        }
        state.snapshots.remove(index);
        Ok(())
    }

    async fn snapshot_restore(&self, index: u64) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        let index = usize::try_from(index).unwrap_or(usize::MAX);
        let chunks = state
            .snapshots
            .get(index)
            .map(|(_, chunks)| chunks.clone())
            .ok_or_else(|| ManagerError::data_node(&self.address, "no such snapshot"))?;
        state.chunks = chunks;
        Ok(())
    }

    async fn sync_list(&self, snapshot: Option<u64>) -> Result<SyncContainer> {
        self.check()?;
        let state = self.state();
        let chunks = match snapshot {
            None => &state.chunks,
            Some(index) => usize::try_from(index)
                .ok()
                .and_then(|i| state.snapshots.get(i))
                .map(|(_, chunks)| chunks)
                .ok_or_else(|| ManagerError::data_node(&self.address, "no such snapshot"))?,
        };
        let file_items = chunks
            .iter()
            .map(|(hash, c)| SyncFileItem {
                hash: *hash,
                usage: c.usage,
                size: c.data.len() as u32,
            })
            .collect();
        Ok(SyncContainer {
            snapshots: state.snapshots.iter().map(|(ts, _)| *ts).collect(),
            file_items,
            used: chunks.values().map(|c| c.data.len() as u64).sum(),
            size: state.size,
        })
    }

    async fn sync_full(&self, source_address: &str, _bytes: u64) -> Result<()> {
        self.check_transfer()?;
        let chunks = self.peer(source_address)?.state().chunks.clone();
        self.state().chunks = chunks;
        Ok(())
    }

    async fn sync_create(&self, hash: &ChunkHash, source_address: &str) -> Result<()> {
        self.check_transfer()?;
        let chunk = self.chunk_from(hash, source_address)?;
        self.state().chunks.insert(*hash, chunk);
        Ok(())
    }

    async fn sync_delete(&self, hash: &ChunkHash) -> Result<()> {
        self.check()?;
        self.state().chunks.remove(hash);
        Ok(())
    }

    async fn sync_move(&self, hash: &ChunkHash, source_address: &str) -> Result<()> {
        self.check_transfer()?;
        let chunk = self.chunk_from(hash, source_address)?;
        self.state().chunks.insert(*hash, chunk);
        self.peer(source_address)?.state().chunks.remove(hash);
        Ok(())
    }

    async fn ping(&self) -> Result<i64> {
        self.check()
            .map_err(|_| ManagerError::Ping(self.address.clone()))?;
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }
        Ok(latency)
    }

    async fn size(&self) -> Result<u64> {
        self.check()?;
        Ok(self.state().size)
    }

    async fn used(&self) -> Result<u64> {
        self.check()?;
        Ok(self.used_bytes())
    }
}

/// A set of simulated nodes that can reach each other.
#[derive(Clone, Default)]
pub struct SimNetwork {
    nodes: Arc<Peers>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings a node online at `address`, reusing any client already handed out.
    pub fn add_node(&self, address: &str, hardware_id: &str, size: u64) -> Arc<SimDataNode> {
        let node = self.entry(address);
        {
            let mut state = node.state();
            state.hardware_id = hardware_id.to_string();
            state.size = size;
        }
        node.set_alive(true);
        node
    }

    pub fn node(&self, address: &str) -> Option<Arc<SimDataNode>> {
        self.nodes.get(address).map(|n| n.clone())
    }

    fn entry(&self, address: &str) -> Arc<SimDataNode> {
        self.nodes
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(SimDataNode::new(address, Arc::downgrade(&self.nodes), false))
            })
            .clone()
    }
}

impl DataNodeConnector for SimNetwork {
    fn connect(&self, address: &str) -> Arc<dyn DataNode> {
        self.entry(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        let network = SimNetwork::new();
        let client = network.connect("10.0.0.9:9430");
        assert!(matches!(client.ping().await, Err(ManagerError::Ping(_))));
        network.add_node("10.0.0.9:9430", "hw", 100);
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn reference_counted_delete() {
        let network = SimNetwork::new();
        let node = network.add_node("a", "hw-a", 1 << 20);
        let hash = node.create(Bytes::from_static(b"chunk")).await.unwrap();
        node.create(Bytes::from_static(b"chunk")).await.unwrap();
        assert_eq!(node.usage(&hash), Some(2));
        node.delete(&hash).await.unwrap();
        assert!(node.has(&hash));
        node.delete(&hash).await.unwrap();
        assert!(!node.has(&hash));
    }

    #[tokio::test]
    async fn node_to_node_transfers() {
        let network = SimNetwork::new();
        let a = network.add_node("a", "hw-a", 1 << 20);
        let b = network.add_node("b", "hw-b", 1 << 20);
        let h1 = a.put(b"one");
        let h2 = a.put(b"two");

        b.sync_create(&h1, "a").await.unwrap();
        assert!(b.has(&h1));
        b.sync_move(&h2, "a").await.unwrap();
        assert!(b.has(&h2) && !a.has(&h2));

        a.sync_full("b", 0).await.unwrap();
        assert_eq!(a.chunks().len(), 2);

        b.fail_transfers(true);
        assert!(b.sync_create(&h1, "a").await.is_err());
    }

    #[tokio::test]
    async fn snapshots_restore_content() {
        let network = SimNetwork::new();
        let node = network.add_node("a", "hw-a", 1 << 20);
        let kept = node.put(b"kept");
        node.snapshot_create().await.unwrap();
        let dropped = node.put(b"dropped");

        let listed = node.sync_list(Some(0)).await.unwrap();
        assert_eq!(listed.hashes(), vec![kept]);
        assert_eq!(listed.snapshots.len(), 1);

        node.snapshot_restore(0).await.unwrap();
        assert!(!node.has(&dropped));
        node.snapshot_delete(0).await.unwrap();
        assert!(node.snapshot_delete(0).await.is_err());
    }
}
