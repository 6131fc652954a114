//! Cross-process mutual exclusion keyed by string.
//!
//! A lock is owned by a random token; only that token can release it. Every
//! lock carries a lease so a holder that dies without unlocking frees the key
//! once the lease runs out. Leases are not renewed.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const UNLOCK_SCRIPT: &str = include_str!("scripts/unlock.lua");
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Single-attempt primitives of a lock backend.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Returns false when `owner` no longer holds `key`.
    async fn release(&self, key: &str, owner: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub lease: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    service: Arc<dyn LockService>,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(service: Arc<dyn LockService>, settings: LockSettings) -> Self {
        Self { service, settings }
    }

    /// Tries to take `key` for up to `timeout`. A zero timeout makes a single
    /// attempt. `Ok(None)` means somebody else holds it.
    pub async fn try_lock(&self, key: &str, timeout: Duration) -> Result<Option<LockGuard>> {
        let owner = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            if self.service.try_acquire(key, &owner, self.settings.lease).await? {
                debug!(key, "Lock acquired");
                return Ok(Some(LockGuard {
                    service: self.service.clone(),
                    key: key.to_string(),
                    owner,
                    released: false,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Runs `critical` while holding `key`, releasing it on every exit path.
    /// Returns `Ok(None)` without running `critical` when the lock is busy.
    pub async fn with_lock<F, T>(&self, key: &str, timeout: Duration, critical: F) -> Result<Option<T>>
    where
        F: Future<Output = T> + Send,
    {
        let Some(guard) = self.try_lock(key, timeout).await? else {
            return Ok(None);
        };

        let output = AssertUnwindSafe(critical).catch_unwind().await;
        guard.unlock().await;

        match output {
            Ok(value) => Ok(Some(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Held lock. Call [`LockGuard::unlock`]; a guard dropped without it (task
/// cancelled mid-section) releases in the background.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub async fn unlock(mut self) {
        self.released = true;
        match self.service.release(&self.key, &self.owner).await {
            Ok(true) => debug!(key = %self.key, "Lock released"),
            Ok(false) => warn!(key = %self.key, "Lock lease expired before release"),
            Err(e) => warn!(key = %self.key, error = %e, "Failed to release lock; lease will expire"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Lock dropped outside runtime; lease will expire");
            return;
        };
        let service = self.service.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = service.release(&key, &owner).await {
                warn!(key = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Locks shared by the tasks of one process.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    leases: DashMap<String, Lease>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut acquired = false;
        self.leases
            .entry(key.to_string())
            .and_modify(|current| {
                if current.expires_at <= now {
                    current.owner = owner.to_string();
                    current.expires_at = now + lease;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                Lease {
                    owner: owner.to_string(),
                    expires_at: now + lease,
                }
            });
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let removed = self
            .leases
            .remove_if(key, |_, lease| lease.owner == owner && lease.expires_at > Instant::now());
        Ok(removed.is_some())
    }
}

/// `SET key token NX PX lease`, released by a compare-and-delete script.
pub struct RedisLockService {
    conn: ConnectionManager,
    unlock_script: Script,
}

impl RedisLockService {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            unlock_script: Script::new(UNLOCK_SCRIPT),
        }
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
