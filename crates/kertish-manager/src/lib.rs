//! Kertish DFS manager: cluster membership and failover, the chunk index,
//! placement with reservations, replica propagation, balancing, whole-cluster
//! moves, snapshots and repair.

pub mod api;
pub mod balancer;
pub mod cli;
pub mod config;
pub mod context;
pub mod datanode;
pub mod error;
pub mod health;
pub mod index;
pub mod locks;
pub mod manager;
pub mod metadata;
pub mod metrics;
pub mod mover;
pub mod operations;
pub mod placement;
pub mod protocol;
pub mod registry;
pub mod repair;
pub mod replication;
pub mod security;
pub mod sim;
pub mod snapshot;
pub mod synchronizer;
pub mod types;

#[cfg(test)]
mod test_support;

pub use api::ManagerApi;
pub use config::ManagerConfig;
pub use error::{ManagerError, Result};
pub use manager::{Manager, ManagerBuilder};
pub use types::{ChunkHash, Cluster, ClusterId, ClusterState, MapType, Node, NodeId, RepairType};
