//! In-process fallbacks for the cache, pub-sub, lock, and clock ports
//!
//! These back single-node deployments and tests. None of them survive a
//! process restart, which is the documented trade-off of running without a
//! shared substrate.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::ChangeEvent;

use super::{Cache, Clock, LockManager, PubSub};

/// TTL-aware in-process cache
pub struct LocalCache {
    entries: DashMap<String, (String, Instant)>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of live entries (expired ones are dropped lazily)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires) = entry.value();
            if *expires > Instant::now() {
                return Ok(Some(value.clone()));
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - self.entries.len())
    }
}

/// Broadcast-channel pub-sub for a single process
pub struct LocalPubSub {
    sender: broadcast::Sender<ChangeEvent>,
}

impl LocalPubSub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Subscribe to every published event
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, event: ChangeEvent) -> Result<()> {
        // No subscribers is fine; events are fire-and-forget
        let _ = self.sender.send(event);
        Ok(())
    }
}

struct LockEntry {
    holder: String,
    expires: Instant,
}

/// Single-process lock table with TTL expiry and per-holder re-entrancy
pub struct LocalLockManager {
    locks: DashMap<String, LockEntry>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entry = self.locks.entry(key.to_string()).or_insert(LockEntry {
            holder: holder.to_string(),
            expires: now + ttl,
        });
        if entry.holder == holder || entry.expires <= now {
            entry.holder = holder.to_string();
            entry.expires = now + ttl;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        self.locks
            .remove_if(key, |_, entry| entry.holder == holder);
        Ok(())
    }
}

/// Real wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced by hand
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write();
        *now = *now + delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
