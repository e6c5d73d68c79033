//! Client side of the data node RPC.
//!
//! [`DataNode`] is the only way the manager talks to storage nodes. The TCP
//! implementation keeps one persistent connection per node, discards it on
//! any failure and re-dials on the next call. [`DataNodes`] caches one client
//! per address.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DataNodeConfig;
use crate::error::{ManagerError, Result};
use crate::protocol::{self, Command, Reply, Request};
use crate::types::{ChunkHash, SyncContainer};

/// RPC surface of a storage node.
#[async_trait]
pub trait DataNode: Send + Sync {
    fn address(&self) -> &str;

    /// Stores a chunk and returns its content hash.
    async fn create(&self, data: Bytes) -> Result<ChunkHash>;

    async fn read(&self, hash: &ChunkHash) -> Result<Bytes>;

    /// Drops one reference to a chunk.
    async fn delete(&self, hash: &ChunkHash) -> Result<()>;

    async fn hardware_id(&self) -> Result<String>;

    /// Makes the node a slave of `master_address` within a cluster.
    async fn join(&self, cluster_id: &str, node_id: &str, master_address: &str) -> Result<()>;

    /// Switches the node between master and slave mode.
    async fn mode(&self, master: bool) -> Result<()>;

    async fn leave(&self) -> Result<()>;

    async fn wipe(&self) -> Result<()>;

    async fn snapshot_create(&self) -> Result<DateTime<Utc>>;

    async fn snapshot_delete(&self, index: u64) -> Result<()>;

    async fn snapshot_restore(&self, index: u64) -> Result<()>;

    /// Lists held chunks, from the live store or from a snapshot.
    async fn sync_list(&self, snapshot: Option<u64>) -> Result<SyncContainer>;

    /// Replaces the node's content with the content of `source_address`.
    /// `bytes` is the amount the source holds and sizes the call's deadline.
    async fn sync_full(&self, source_address: &str, bytes: u64) -> Result<()>;

    /// Pulls one chunk from `source_address`.
    async fn sync_create(&self, hash: &ChunkHash, source_address: &str) -> Result<()>;

    /// Removes a chunk regardless of its reference count.
    async fn sync_delete(&self, hash: &ChunkHash) -> Result<()>;

    /// Pulls one chunk from `source_address` and removes it there.
    async fn sync_move(&self, hash: &ChunkHash, source_address: &str) -> Result<()>;

    /// Round trip latency in milliseconds.
    async fn ping(&self) -> Result<i64>;

    /// Declared capacity in bytes.
    async fn size(&self) -> Result<u64>;

    async fn used(&self) -> Result<u64>;
}

/// Creates clients for node addresses.
pub trait DataNodeConnector: Send + Sync {
    fn connect(&self, address: &str) -> Arc<dyn DataNode>;
}

/// Client cache keyed by node address.
pub struct DataNodes {
    connector: Arc<dyn DataNodeConnector>,
    cache: DashMap<String, Arc<dyn DataNode>>,
}

impl DataNodes {
    pub fn new(connector: Arc<dyn DataNodeConnector>) -> Self {
        Self {
            connector,
            cache: DashMap::new(),
        }
    }

    pub fn get(&self, address: &str) -> Arc<dyn DataNode> {
        self.cache
            .entry(address.to_string())
            .or_insert_with(|| self.connector.connect(address))
            .clone()
    }
}

/// Opens [`TcpDataNode`] clients.
pub struct TcpConnector {
    config: DataNodeConfig,
}

impl TcpConnector {
    pub fn new(config: DataNodeConfig) -> Self {
        Self { config }
    }
}

impl DataNodeConnector for TcpConnector {
    fn connect(&self, address: &str) -> Arc<dyn DataNode> {
        Arc::new(TcpDataNode::new(address, self.config.clone()))
    }
}

/// Data node client over a persistent TCP connection.
pub struct TcpDataNode {
    address: String,
    config: DataNodeConfig,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl TcpDataNode {
    pub fn new(address: &str, config: DataNodeConfig) -> Self {
        Self {
            address: address.to_string(),
            config,
            conn: Mutex::new(None),
        }
    }

    async fn call(&self, request: Request, deadline: Duration) -> Result<Reply> {
        let command = request.command();
        let mut conn = self.conn.lock().await;
        let outcome = tokio::time::timeout(
            deadline,
            self.exchange(&mut conn, command, request.freeze()),
        )
        .await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                *conn = None;
                debug!(address = %self.address, %command, error = %e, "data node call failed");
                Err(ManagerError::data_node(&self.address, format!("{command}: {e}")))
            }
            Err(_) => {
                *conn = None;
                Err(ManagerError::data_node(
                    &self.address,
                    format!("{command}: timed out after {deadline:?}"),
                ))
            }
        }
    }

    async fn exchange(
        &self,
        conn: &mut Option<BufStream<TcpStream>>,
        command: Command,
        request: Bytes,
    ) -> Result<Reply> {
        if conn.is_none() {
            let stream = tokio::time::timeout(
                self.config.connect_timeout(),
                TcpStream::connect(&self.address),
            )
            .await
            .map_err(|_| ManagerError::data_node(&self.address, "connect timed out"))??;
            stream.set_nodelay(true)?;
            debug!(address = %self.address, "data node connected");
            *conn = Some(BufStream::new(stream));
        }
        let stream = conn
            .as_mut()
            .ok_or_else(|| ManagerError::data_node(&self.address, "no connection"))?;
        stream.write_all(&request).await?;
        stream.flush().await?;
        protocol::read_reply(stream, command.reply_kind()).await
    }

    fn base_deadline(&self) -> Duration {
        self.config.deadline_for(0)
    }

    async fn call_empty(&self, request: Request) -> Result<()> {
        self.call(request, self.base_deadline()).await.map(|_| ())
    }
}

#[async_trait]
impl DataNode for TcpDataNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn create(&self, data: Bytes) -> Result<ChunkHash> {
        let deadline = self.config.deadline_for(data.len() as u64);
        let request = Request::new(Command::Create).blob(&data)?;
        self.call(request, deadline).await?.into_hash()
    }

    async fn read(&self, hash: &ChunkHash) -> Result<Bytes> {
        let request = Request::new(Command::Read).hash(hash);
        let deadline = self.config.deadline_for(u64::from(protocol::MAX_BLOB_SIZE));
        self.call(request, deadline).await?.into_blob()
    }

    async fn delete(&self, hash: &ChunkHash) -> Result<()> {
        self.call_empty(Request::new(Command::Delete).hash(hash)).await
    }

    async fn hardware_id(&self) -> Result<String> {
        self.call(Request::new(Command::HardwareId), self.base_deadline())
            .await?
            .into_text()
    }

    async fn join(&self, cluster_id: &str, node_id: &str, master_address: &str) -> Result<()> {
        let request = Request::new(Command::Join)
            .string(cluster_id)?
            .string(node_id)?
            .string(master_address)?;
        self.call_empty(request).await
    }

    async fn mode(&self, master: bool) -> Result<()> {
        self.call_empty(Request::new(Command::Mode).flag(master)).await
    }

    async fn leave(&self) -> Result<()> {
        self.call_empty(Request::new(Command::Leave)).await
    }

    async fn wipe(&self) -> Result<()> {
        self.call_empty(Request::new(Command::Wipe)).await
    }

    async fn snapshot_create(&self) -> Result<DateTime<Utc>> {
        self.call(Request::new(Command::SnapshotCreate), self.base_deadline())
            .await?
            .into_timestamp()
    }

    async fn snapshot_delete(&self, index: u64) -> Result<()> {
        self.call_empty(Request::new(Command::SnapshotDelete).number(index))
            .await
    }

    async fn snapshot_restore(&self, index: u64) -> Result<()> {
        self.call_empty(Request::new(Command::SnapshotRestore).number(index))
            .await
    }

    async fn sync_list(&self, snapshot: Option<u64>) -> Result<SyncContainer> {
        let request = Request::new(Command::SyncList)
            .flag(snapshot.is_some())
            .number(snapshot.unwrap_or_default());
        // Listing cost grows with the node's content, not with the request.
        let deadline = self.base_deadline() * 4;
        self.call(request, deadline).await?.into_sync_list()
    }

    async fn sync_full(&self, source_address: &str, bytes: u64) -> Result<()> {
        let request = Request::new(Command::SyncFull).string(source_address)?;
        let deadline = self.config.deadline_for(bytes);
        self.call(request, deadline).await.map(|_| ())
    }

    async fn sync_create(&self, hash: &ChunkHash, source_address: &str) -> Result<()> {
        let request = Request::new(Command::SyncCreate)
            .hash(hash)
            .string(source_address)?;
        self.call_empty(request).await
    }

    async fn sync_delete(&self, hash: &ChunkHash) -> Result<()> {
        self.call_empty(Request::new(Command::SyncDelete).hash(hash))
            .await
    }

    async fn sync_move(&self, hash: &ChunkHash, source_address: &str) -> Result<()> {
        let request = Request::new(Command::SyncMove)
            .hash(hash)
            .string(source_address)?;
        self.call_empty(request).await
    }

    async fn ping(&self) -> Result<i64> {
        let started = Instant::now();
        self.call(Request::new(Command::Ping), self.config.ping_timeout())
            .await
            .map_err(|_| ManagerError::Ping(self.address.clone()))?;
        Ok(started.elapsed().as_millis() as i64)
    }

    async fn size(&self) -> Result<u64> {
        self.call(Request::new(Command::Size), self.base_deadline())
            .await?
            .into_number()
    }

    async fn used(&self) -> Result<u64> {
        self.call(Request::new(Command::Used), self.base_deadline())
            .await?
            .into_number()
    }
}
