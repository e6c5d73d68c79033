//! Distributed mutex service with leases.
//!
//! A lock is a lease on a string key. The holder receives a fencing token that
//! increases with every grant, and a background heartbeat renews the lease
//! while the guard is alive. A holder that crashes stops renewing, so its
//! lease expires after the TTL and the key can be taken over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{ManagerError, Result};

/// Key-lease primitive backing every manager lock.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Takes the lease when the key is free or its lease expired.
    /// Returns the fencing token of the new lease.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<u64>>;

    /// Extends a lease. Returns false when `token` no longer owns the key.
    async fn renew(&self, key: &str, token: u64, ttl: Duration) -> Result<bool>;

    /// Drops a lease if `token` still owns it.
    async fn release(&self, key: &str, token: u64) -> Result<()>;

    /// True while an unexpired lease exists for the key.
    async fn is_locked(&self, key: &str) -> Result<bool>;
}

struct Lease {
    token: u64,
    expires_at: Instant,
}

/// In-process lease table.
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, Lease>>,
    next_token: AtomicU64,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>> {
        self.leases
            .lock()
            .map_err(|e| ManagerError::Lock(e.to_string()))
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<u64>> {
        let now = Instant::now();
        let mut leases = self.table()?;
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return Ok(None);
            }
            debug!(key, token = lease.token, "taking over expired lease");
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            key.to_string(),
            Lease {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn renew(&self, key: &str, token: u64, ttl: Duration) -> Result<bool> {
        let mut leases = self.table()?;
        match leases.get_mut(key) {
            Some(lease) if lease.token == token => {
                lease.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: u64) -> Result<()> {
        let mut leases = self.table()?;
        if leases.get(key).is_some_and(|l| l.token == token) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        let leases = self.table()?;
        Ok(leases
            .get(key)
            .is_some_and(|l| l.expires_at > Instant::now()))
    }
}

/// Blocking lock acquisition on top of a [`LockService`].
#[derive(Clone)]
pub struct Locker {
    service: Arc<dyn LockService>,
    ttl: Duration,
    poll_interval: Duration,
}

impl Locker {
    pub fn new(service: Arc<dyn LockService>, config: &LockConfig) -> Self {
        Self {
            service,
            ttl: config.lease_ttl(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Waits until the key is free, then holds it until the guard is dropped.
    pub async fn lock(&self, key: &str) -> Result<LockGuard> {
        loop {
            if let Some(guard) = self.try_lock(key).await? {
                return Ok(guard);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn try_lock(&self, key: &str) -> Result<Option<LockGuard>> {
        let Some(token) = self.service.try_acquire(key, self.ttl).await? else {
            return Ok(None);
        };
        let heartbeat = spawn_heartbeat(self.service.clone(), key.to_string(), token, self.ttl);
        Ok(Some(LockGuard {
            key: key.to_string(),
            token,
            service: self.service.clone(),
            heartbeat: Some(heartbeat),
        }))
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        self.service.is_locked(key).await
    }
}

fn spawn_heartbeat(
    service: Arc<dyn LockService>,
    key: String,
    token: u64,
    ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = ttl / 3;
        loop {
            tokio::time::sleep(period).await;
            match service.renew(&key, token, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(key = %key, token, "lease lost before release");
                    break;
                }
                Err(e) => warn!(key = %key, token, error = %e, "lease renewal failed"),
            }
        }
    })
}

/// A held lease. Dropping it releases the key.
pub struct LockGuard {
    key: String,
    token: u64,
    service: Arc<dyn LockService>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    /// Fencing token of this lease.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Releases the key and waits for the release to be recorded.
    pub async fn unlock(mut self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.service.release(&self.key, self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(heartbeat) = self.heartbeat.take() else {
            return;
        };
        heartbeat.abort();
        let service = self.service.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = service.release(&key, token).await {
                    warn!(key = %key, token, error = %e, "lease release failed");
                }
            });
        }
    }
}
