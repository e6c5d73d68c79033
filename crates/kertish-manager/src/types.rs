//! Core data model shared by every manager component.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{ManagerError, Result};

/// Cluster identifier.
pub type ClusterId = String;
/// Node identifier, derived from the node's hardware identity.
pub type NodeId = String;

/// Quality value recorded for a node that did not answer its last probe.
pub const QUALITY_UNREACHABLE: i64 = i64::MAX;

/// Content hash of a stored chunk (SHA-256, 32 raw bytes on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHash([u8; 32]);

impl ChunkHash {
    /// Length of the raw hash in bytes.
    pub const LEN: usize = 32;

    /// Wraps raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hashes chunk content.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

impl FromStr for ChunkHash {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        let decoded = hex::decode(s.trim())
            .map_err(|e| ManagerError::InvalidRequest(format!("bad hash {s:?}: {e}")))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| ManagerError::InvalidRequest(format!("hash {s:?} is not 32 bytes")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ChunkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A storage node as recorded in its cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub master: bool,
    pub quality: i64,
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>, master: bool) -> Self {
        Self {
            id,
            address: address.into(),
            master,
            quality: 0,
        }
    }

    /// Deterministic node id from hardware identity, bind address and declared capacity.
    pub fn derive_id(hardware_id: &str, address: &str, size: u64) -> NodeId {
        let mut hasher = Sha256::new();
        hasher.update(hardware_id.as_bytes());
        hasher.update(address.as_bytes());
        hasher.update(size.to_le_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn is_reachable(&self) -> bool {
        self.quality != QUALITY_UNREACHABLE
    }
}

/// Administrative availability of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Serves reads and accepts new chunks.
    #[default]
    Online,
    /// Serves reads only.
    Readonly,
    /// Excluded from lookups and placement.
    Offline,
}

impl ClusterState {
    pub fn readable(&self) -> bool {
        matches!(self, ClusterState::Online | ClusterState::Readonly)
    }

    pub fn writable(&self) -> bool {
        matches!(self, ClusterState::Online)
    }
}

impl FromStr for ClusterState {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(ClusterState::Online),
            "readonly" => Ok(ClusterState::Readonly),
            "offline" => Ok(ClusterState::Offline),
            other => Err(ManagerError::InvalidRequest(format!(
                "unknown cluster state {other:?}"
            ))),
        }
    }
}

/// A replicated pool of storage nodes sharing the same chunk set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub size: u64,
    pub used: u64,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub reservations: HashMap<String, u64>,
    #[serde(default)]
    pub paralyzed: bool,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub state: ClusterState,
    #[serde(default)]
    pub snapshots: Vec<DateTime<Utc>>,
}

impl Cluster {
    pub fn new(id: impl Into<ClusterId>) -> Self {
        Self {
            id: id.into(),
            size: 0,
            used: 0,
            nodes: Vec::new(),
            reservations: HashMap::new(),
            paralyzed: false,
            frozen: false,
            state: ClusterState::Online,
            snapshots: Vec::new(),
        }
    }

    pub fn available(&self) -> u64 {
        self.size.saturating_sub(self.used)
    }

    /// Fraction of capacity in use; a cluster without capacity counts as full.
    pub fn weight(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        self.used as f64 / self.size as f64
    }

    pub fn master(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.master)
    }

    pub fn slaves(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.master)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == node_id)
    }

    pub fn node_by_address(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Masters first, then ascending latency.
    pub fn sort_nodes(&mut self) {
        self.nodes
            .sort_by(|a, b| b.master.cmp(&a.master).then(a.quality.cmp(&b.quality)));
    }

    /// Makes `node_id` the only master. Returns false if the node is not a member.
    pub fn set_master(&mut self, node_id: &str) -> bool {
        if self.node(node_id).is_none() {
            return false;
        }
        for node in &mut self.nodes {
            node.master = node.id == node_id;
        }
        self.sort_nodes();
        true
    }

    /// Reachable node with the best quality, optionally restricted to `holders`.
    pub fn best_node<'a>(&'a self, holders: Option<&[NodeId]>) -> Option<&'a Node> {
        self.nodes
            .iter()
            .filter(|n| n.is_reachable())
            .filter(|n| holders.map_or(true, |h| h.contains(&n.id)))
            .min_by_key(|n| n.quality)
    }

    /// Accepts new chunks: online, not paralyzed and has a master.
    pub fn writable(&self) -> bool {
        self.state.writable() && !self.paralyzed && self.master().is_some()
    }

    /// Adds `size` bytes to `Used` under a reservation id.
    pub fn reserve(&mut self, reservation_id: &str, size: u64) -> Result<()> {
        if self.available() < size {
            return Err(ManagerError::NoDiskSpace { needed: size });
        }
        self.used += size;
        *self
            .reservations
            .entry(reservation_id.to_string())
            .or_insert(0) += size;
        Ok(())
    }

    /// Replaces the reserved bytes with the bytes actually written.
    /// Returns false when the cluster holds no such reservation.
    pub fn commit(&mut self, reservation_id: &str, size: u64) -> bool {
        match self.reservations.remove(reservation_id) {
            Some(reserved) => {
                self.used = self.used.saturating_sub(reserved) + size;
                true
            }
            None => false,
        }
    }

    /// Releases the reserved bytes. Returns false when there is nothing to release.
    pub fn discard(&mut self, reservation_id: &str) -> bool {
        match self.reservations.remove(reservation_id) {
            Some(reserved) => {
                self.used = self.used.saturating_sub(reserved);
                true
            }
            None => false,
        }
    }

    /// Resets usage bookkeeping from a master's authoritative report.
    pub fn reset_usage(&mut self, used: u64, snapshots: Vec<DateTime<Utc>>) {
        self.used = used;
        self.reservations.clear();
        self.snapshots = snapshots;
    }
}

/// One chunk slot of a file, before its content hash is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub sequence: u32,
    pub size: u64,
}

/// A stored chunk of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunk {
    pub sequence: u32,
    pub size: u64,
    pub hash: ChunkHash,
}

/// Where one chunk of a reservation should be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationMapEntry {
    pub cluster_id: ClusterId,
    pub address: String,
    pub chunk: Chunk,
}

/// Placement decided for a multi-chunk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationMap {
    pub id: String,
    pub clusters: Vec<ReservationMapEntry>,
}

/// Purpose of a chunk location lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapType {
    Read,
    Create,
    Delete,
}

impl FromStr for MapType {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" | "r" => Ok(MapType::Read),
            "create" | "c" => Ok(MapType::Create),
            "delete" | "d" => Ok(MapType::Delete),
            other => Err(ManagerError::InvalidRequest(format!("unknown map type {other:?}"))),
        }
    }
}

/// Which repair passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepairType {
    #[default]
    Full,
    Structure,
    Integrity,
}

impl RepairType {
    pub fn structure(&self) -> bool {
        matches!(self, RepairType::Full | RepairType::Structure)
    }

    pub fn integrity(&self) -> bool {
        matches!(self, RepairType::Full | RepairType::Integrity)
    }
}

impl FromStr for RepairType {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "full" => Ok(RepairType::Full),
            "structure" => Ok(RepairType::Structure),
            "integrity" => Ok(RepairType::Integrity),
            other => Err(ManagerError::InvalidRequest(format!("unknown repair type {other:?}"))),
        }
    }
}

/// Persisted repair progress flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairDetail {
    pub processing: bool,
    pub repair_type: Option<RepairType>,
    pub timestamp: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One chunk held by a node, as reported by a sync list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFileItem {
    pub hash: ChunkHash,
    pub usage: u16,
    pub size: u32,
}

/// Authoritative content listing of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContainer {
    pub snapshots: Vec<DateTime<Utc>>,
    pub file_items: Vec<SyncFileItem>,
    pub used: u64,
    pub size: u64,
}

impl SyncContainer {
    pub fn hashes(&self) -> Vec<ChunkHash> {
        self.file_items.iter().map(|i| i.hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with(size: u64, used: u64) -> Cluster {
        let mut cluster = Cluster::new("c1");
        cluster.size = size;
        cluster.used = used;
        cluster
    }

    #[test]
    fn hash_hex_round_trip() {
        let hash = ChunkHash::of(b"hello");
        let parsed: ChunkHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!("abcd".parse::<ChunkHash>().is_err());
        assert!("zz".parse::<ChunkHash>().is_err());
    }

    #[test]
    fn hash_serializes_as_hex_string() {
        let hash = ChunkHash::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
    }

    #[test]
    fn node_id_is_deterministic() {
        let a = Node::derive_id("hw-1", "10.0.0.1:9430", 1 << 30);
        let b = Node::derive_id("hw-1", "10.0.0.1:9430", 1 << 30);
        let c = Node::derive_id("hw-1", "10.0.0.1:9431", 1 << 30);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn masters_sort_first_then_quality() {
        let mut cluster = Cluster::new("c1");
        cluster.nodes = vec![
            Node { id: "a".into(), address: "a".into(), master: false, quality: 9 },
            Node { id: "b".into(), address: "b".into(), master: false, quality: 3 },
            Node { id: "c".into(), address: "c".into(), master: true, quality: 20 },
        ];
        cluster.sort_nodes();
        let ids: Vec<&str> = cluster.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn set_master_keeps_single_master() {
        let mut cluster = Cluster::new("c1");
        cluster.nodes = vec![Node::new("a".into(), "a", true), Node::new("b".into(), "b", false)];
        assert!(cluster.set_master("b"));
        assert_eq!(cluster.nodes.iter().filter(|n| n.master).count(), 1);
        assert_eq!(cluster.master().unwrap().id, "b");
        assert!(!cluster.set_master("missing"));
        assert_eq!(cluster.master().unwrap().id, "b");
    }

    #[test]
    fn reserve_commit_discard_accounting() {
        let mut cluster = cluster_with(100, 10);
        cluster.reserve("r1", 30).unwrap();
        cluster.reserve("r1", 20).unwrap();
        assert_eq!(cluster.used, 60);
        assert_eq!(cluster.reservations["r1"], 50);

        assert!(cluster.commit("r1", 35));
        assert_eq!(cluster.used, 45);
        assert!(!cluster.commit("r1", 35));
        assert_eq!(cluster.used, 45);

        cluster.reserve("r2", 40).unwrap();
        assert!(cluster.discard("r2"));
        assert_eq!(cluster.used, 45);
        assert!(!cluster.discard("r2"));
    }

    #[test]
    fn reserve_rejects_overflow() {
        let mut cluster = cluster_with(100, 95);
        let err = cluster.reserve("r1", 6).unwrap_err();
        assert!(matches!(err, ManagerError::NoDiskSpace { needed: 6 }));
        assert_eq!(cluster.used, 95);
        assert!(cluster.reservations.is_empty());
    }

    #[test]
    fn best_node_skips_unreachable() {
        let mut cluster = Cluster::new("c1");
        cluster.nodes = vec![
            Node { id: "a".into(), address: "a".into(), master: true, quality: QUALITY_UNREACHABLE },
            Node { id: "b".into(), address: "b".into(), master: false, quality: 7 },
            Node { id: "c".into(), address: "c".into(), master: false, quality: 4 },
        ];
        assert_eq!(cluster.best_node(None).unwrap().id, "c");
        let holders = vec!["a".to_string(), "b".to_string()];
        assert_eq!(cluster.best_node(Some(&holders)).unwrap().id, "b");
    }

    #[test]
    fn parse_enums() {
        assert_eq!("READONLY".parse::<ClusterState>().unwrap(), ClusterState::Readonly);
        assert_eq!("d".parse::<MapType>().unwrap(), MapType::Delete);
        assert_eq!("".parse::<RepairType>().unwrap(), RepairType::Full);
        assert!("sideways".parse::<RepairType>().is_err());
    }
}
