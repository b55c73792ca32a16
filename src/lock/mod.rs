//! Run lock for evaluation passes
//!
//! At most one pass per job name runs at a time. The lock carries a TTL so a
//! pass that dies without releasing it does not block later passes forever.

use crate::clock::Clock;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Proof of holding a lock; pass it back to `release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub job: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunLock: Send + Sync {
    /// `Ok(None)` when another holder has the lock
    async fn try_acquire(&self, job: &str, ttl: Duration) -> Result<Option<LockGuard>>;

    /// Release only if `guard` still holds the lock
    async fn release(&self, guard: &LockGuard) -> Result<()>;
}

pub struct MemoryRunLock {
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, LockGuard>>,
}

impl MemoryRunLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_held(&self, job: &str) -> bool {
        let now = self.clock.now();
        self.held
            .lock()
            .get(job)
            .map(|g| g.expires_at > now)
            .unwrap_or(false)
    }
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn try_acquire(&self, job: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let now = self.clock.now();
        let mut held = self.held.lock();
        if let Some(current) = held.get(job) {
            if current.expires_at > now {
                debug!("Lock: {} held until {}", job, current.expires_at);
                return Ok(None);
            }
            debug!("Lock: {} expired at {}, taking over", job, current.expires_at);
        }
        let guard = LockGuard {
            job: job.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: now + ttl,
        };
        held.insert(job.to_string(), guard.clone());
        Ok(Some(guard))
    }

    async fn release(&self, guard: &LockGuard) -> Result<()> {
        let mut held = self.held.lock();
        if held.get(&guard.job).map(|g| g.token == guard.token).unwrap_or(false) {
            held.remove(&guard.job);
        }
        Ok(())
    }
}
