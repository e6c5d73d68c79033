use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub bind_addr: SocketAddr,
    pub admin_token: Option<String>,
    pub log_json: bool,
    pub health: HealthConfig,
    pub replication: ReplicationConfig,
    pub placement: PlacementConfig,
    pub balance: BalanceConfig,
    pub datanode: DataNodeConfig,
    pub locks: LockConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9400)),
            admin_token: None,
            log_json: false,
            health: HealthConfig::default(),
            replication: ReplicationConfig::default(),
            placement: PlacementConfig::default(),
            balance: BalanceConfig::default(),
            datanode: DataNodeConfig::default(),
            locks: LockConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ManagerConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ManagerConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub maintain_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            maintain_interval_secs: 24 * 60 * 60,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn maintain_interval(&self) -> Duration {
        Duration::from_secs(self.maintain_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Jobs processed in parallel per cluster.
    pub concurrency: usize,
    /// Jobs buffered per cluster before `enqueue` waits.
    pub queue_capacity: usize,
    /// Attempts each target gets before the job is abandoned.
    pub retries: u8,
    pub cooldown_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queue_capacity: 1024,
            retries: 5,
            cooldown_secs: 30,
        }
    }
}

impl ReplicationConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub chunk_size: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Weight spread below which clusters count as balanced.
    pub threshold: f64,
    /// Concurrent chunk moves per source cluster.
    pub concurrency: usize,
    /// Fraction of failed chunk moves that aborts a cluster move.
    pub max_failure_ratio: f64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            concurrency: 10,
            max_failure_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataNodeConfig {
    pub connect_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Deadline for calls without a payload-derived budget.
    pub base_timeout_secs: u64,
    /// Slowest transfer rate tolerated when deriving deadlines from payload size.
    pub min_throughput_bytes_per_sec: u64,
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            ping_timeout_ms: 2000,
            base_timeout_secs: 30,
            min_throughput_bytes_per_sec: 1024 * 1024,
        }
    }
}

impl DataNodeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Base deadline plus the time `bytes` take at the minimum throughput.
    pub fn deadline_for(&self, bytes: u64) -> Duration {
        let rate = self.min_throughput_bytes_per_sec.max(1);
        Duration::from_secs(self.base_timeout_secs) + Duration::from_millis(bytes * 1000 / rate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub lease_ttl_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 30_000,
            poll_interval_ms: 25,
        }
    }
}

impl LockConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms.max(10))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
