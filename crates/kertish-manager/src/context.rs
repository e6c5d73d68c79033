use std::sync::Arc;

use crate::datanode::DataNodes;
use crate::index::ChunkIndex;
use crate::metrics::ManagerMetrics;
use crate::registry::Registry;

/// Handles shared by every manager component.
#[derive(Clone)]
pub struct Context {
    pub registry: Arc<Registry>,
    pub index: Arc<dyn ChunkIndex>,
    pub nodes: Arc<DataNodes>,
    pub metrics: Arc<ManagerMetrics>,
}
