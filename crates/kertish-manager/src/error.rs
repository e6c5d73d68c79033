//! Error types for the manager.

use thiserror::Error;

use crate::types::{ChunkHash, ClusterId, NodeId};

/// Errors that can occur in the manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No cluster is registered under the id.
    #[error("cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    /// No cluster contains a node with the id or address.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The chunk index has no entry for the hash in the searched clusters.
    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkHash),

    /// No cluster holds a reservation with the id.
    #[error("reservation not found: {0}")]
    ReservationNotFound(String),

    /// A cluster with the same id is already registered.
    #[error("cluster already exists: {0}")]
    Exists(ClusterId),

    /// The node is already a member of a cluster.
    #[error("node {node_id} is already registered in cluster {cluster_id}")]
    Registered {
        /// Derived id of the node.
        node_id: NodeId,
        /// Cluster that owns the node.
        cluster_id: ClusterId,
    },

    /// The node is the only member of its cluster.
    #[error("node {0} is the last node of its cluster")]
    LastNode(NodeId),

    /// The cluster is frozen by another operation.
    #[error("cluster {0} is frozen")]
    Frozen(ClusterId),

    /// A repair is already running.
    #[error("repair is already in progress")]
    Processing,

    /// No reachable node can serve the request.
    #[error("no available node in cluster {0}")]
    NoAvailableClusterNode(ClusterId),

    /// No eligible cluster can fit the requested bytes.
    #[error("no disk space for {needed} bytes")]
    NoDiskSpace {
        /// Bytes that could not be placed.
        needed: u64,
    },

    /// The node did not answer a ping.
    #[error("ping failed for {0}")]
    Ping(String),

    /// The cluster cannot take part in the requested action right now.
    #[error("cluster {0} is not available for cluster action")]
    NotAvailableForClusterAction(ClusterId),

    /// A repair pass failed.
    #[error("repair failed: {0}")]
    Repair(String),

    /// A cluster could not be synchronized.
    #[error("sync failed for cluster {cluster_id}: {reason}")]
    Sync {
        /// Cluster that failed to sync.
        cluster_id: ClusterId,
        /// Underlying failure.
        reason: String,
    },

    /// A bulk operation failed for more items than tolerated.
    #[error("too many errors: {failed} of {total} items failed")]
    TooManyErrors {
        /// Items that failed.
        failed: usize,
        /// Items attempted.
        total: usize,
    },

    /// Per-item failures collected by a bulk operation.
    #[error("{} item(s) failed: {}", .0.len(), .0.join("; "))]
    Bulk(Vec<String>),

    /// RPC to a data node failed.
    #[error("data node {address}: {reason}")]
    DataNode {
        /// Address of the node.
        address: String,
        /// What went wrong.
        reason: String,
    },

    /// Malformed wire payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request parameters are missing or malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Backing store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Mutex service failure.
    #[error("lock error: {0}")]
    Lock(String),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Stable numeric code reported in HTTP error bodies.
    pub fn code(&self) -> u16 {
        match self {
            ManagerError::ClusterNotFound(_) => 100,
            ManagerError::NodeNotFound(_) => 101,
            ManagerError::ChunkNotFound(_) => 102,
            ManagerError::ReservationNotFound(_) => 103,
            ManagerError::Exists(_) => 110,
            ManagerError::Registered { .. } => 111,
            ManagerError::LastNode(_) => 112,
            ManagerError::Frozen(_) => 120,
            ManagerError::Processing => 121,
            ManagerError::NoAvailableClusterNode(_) => 130,
            ManagerError::NoDiskSpace { .. } => 131,
            ManagerError::Ping(_) => 132,
            ManagerError::NotAvailableForClusterAction(_) => 133,
            ManagerError::Repair(_) => 141,
            ManagerError::Sync { .. } => 142,
            ManagerError::TooManyErrors { .. } => 150,
            ManagerError::Bulk(_) => 151,
            ManagerError::DataNode { .. } => 160,
            ManagerError::Protocol(_) => 161,
            ManagerError::InvalidRequest(_) => 170,
            ManagerError::Store(_) => 180,
            ManagerError::Lock(_) => 181,
            ManagerError::Io(_) => 190,
        }
    }

    /// True for failures where a later retry may succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ManagerError::NoAvailableClusterNode(_)
                | ManagerError::NoDiskSpace { .. }
                | ManagerError::Ping(_)
                | ManagerError::NotAvailableForClusterAction(_)
                | ManagerError::DataNode { .. }
        )
    }

    pub(crate) fn data_node(address: &str, reason: impl std::fmt::Display) -> Self {
        ManagerError::DataNode {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias used across the manager.
pub type Result<T> = std::result::Result<T, ManagerError>;
