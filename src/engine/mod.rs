//! Memory orchestration engine
//!
//! One `MemoryEngine` owns the port handles and exposes every core
//! operation. There is no module-level state: the engine is an explicit
//! context passed to (or wrapped by) the transport layer.
//!
//! Submodules split the write path out of the shared plumbing:
//!
//! - `save` - the dual-write coordinator
//! - `conflict` - contradiction heuristics and conflict resolution
//! - `compensation` - reconciliation of partial dual writes
//! - `expiry` - the expiry sweeper

pub mod compensation;
pub mod conflict;
pub mod expiry;
pub mod save;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DeploymentMode, EngineConfig};
use crate::error::{MemoriaError, Result};
use crate::events::{ChangeEvent, Topic};
use crate::fingerprint::{scope_cache_prefix, scope_hash};
use crate::ports::{LocalCache, LocalLockManager, Ports};
use crate::types::{Capabilities, EngineStats, MemoryRecord, Page, Scope};

pub use compensation::{CompensationAction, CompensationQueue, CompensationTask, CompensationWorker};
pub use expiry::SweepReport;

/// Operation counters, shared with background workers
#[derive(Default)]
pub(crate) struct Stats {
    saves: AtomicU64,
    idempotent_saves: AtomicU64,
    conflicts_detected: AtomicU64,
    searches: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    compensations_enqueued: AtomicU64,
    compensations_failed: AtomicU64,
    records_expired: AtomicU64,
}

impl Stats {
    pub(crate) fn save(&self) {
        self.saves.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn idempotent_save(&self) {
        self.idempotent_saves.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn conflicts(&self, n: u64) {
        self.conflicts_detected.fetch_add(n, Ordering::Relaxed);
    }
    pub(crate) fn search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn compensation_enqueued(&self) {
        self.compensations_enqueued.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn compensation_failed(&self) {
        self.compensations_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn expired(&self, n: u64) {
        self.records_expired.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            saves: self.saves.load(Ordering::Relaxed),
            idempotent_saves: self.idempotent_saves.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            compensations_enqueued: self.compensations_enqueued.load(Ordering::Relaxed),
            compensations_failed: self.compensations_failed.load(Ordering::Relaxed),
            records_expired: self.records_expired.load(Ordering::Relaxed),
        }
    }
}

/// Per-scope sweeper bookkeeping
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SweepMark {
    /// Earliest upcoming expiry in the scope; None when nothing is due
    pub(crate) next_due: Option<DateTime<Utc>>,
    pub(crate) last_swept: Option<DateTime<Utc>>,
}

/// The memory orchestration engine
pub struct MemoryEngine {
    pub(crate) ports: Ports,
    pub(crate) config: EngineConfig,
    pub(crate) capabilities: RwLock<Capabilities>,
    pub(crate) compensation: Arc<CompensationQueue>,
    pub(crate) stats: Arc<Stats>,
    /// Scopes that have seen at least one write, for sweeps and cross-scope audits
    pub(crate) known_scopes: DashMap<String, Scope>,
    pub(crate) sweep_marks: DashMap<String, SweepMark>,
    /// In-process stand-ins used when the shared substrate errors on a
    /// single-node deployment
    pub(crate) fallback_cache: LocalCache,
    pub(crate) fallback_locks: LocalLockManager,
}

impl MemoryEngine {
    /// Probe backend capabilities, build the engine, and spawn compensation
    /// workers.
    pub async fn start(ports: Ports, config: EngineConfig) -> Arc<Self> {
        let capabilities = Capabilities {
            vector_available: ports.vector.available().await,
            graph_available: ports.graph.available().await,
            distributed: ports.cache.is_distributed()
                && ports.pubsub.is_distributed()
                && ports.locks.is_distributed(),
        };
        info!(
            vector = capabilities.vector_available,
            graph = capabilities.graph_available,
            distributed = capabilities.distributed,
            "memory engine starting"
        );

        let engine = Arc::new(Self {
            compensation: Arc::new(CompensationQueue::new()),
            capabilities: RwLock::new(capabilities),
            stats: Arc::new(Stats::default()),
            known_scopes: DashMap::new(),
            sweep_marks: DashMap::new(),
            fallback_cache: LocalCache::new(),
            fallback_locks: LocalLockManager::new(),
            ports,
            config,
        });

        for _ in 0..engine.config.compensation.workers {
            let worker = CompensationWorker::new(
                engine.ports.clone(),
                engine.compensation.clone(),
                engine.config.compensation,
                engine.stats.clone(),
            );
            tokio::spawn(async move { worker.run().await });
        }

        engine
    }

    /// Capability flags captured at startup
    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.read()
    }

    /// Re-probe both stores and report current capability flags
    pub async fn graph_status(&self) -> Capabilities {
        let refreshed = Capabilities {
            vector_available: self.ports.vector.available().await,
            graph_available: self.ports.graph.available().await,
            distributed: self.capabilities.read().distributed,
        };
        *self.capabilities.write() = refreshed;
        refreshed
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Queued compensation tasks
    pub fn compensation_len(&self) -> usize {
        self.compensation.len()
    }

    /// Process every queued compensation task once, without backoff. Meant
    /// for tests and shutdown; production relies on the spawned workers.
    pub async fn drain_compensation(&self) {
        CompensationWorker::new(
            self.ports.clone(),
            self.compensation.clone(),
            self.config.compensation,
            self.stats.clone(),
        )
        .drain()
        .await;
    }

    /// Fetch one record by id
    pub async fn get(&self, scope: &Scope, id: &str) -> Result<MemoryRecord> {
        scope.validate()?;
        let fetched = self
            .with_budget(
                "vector.fetch",
                self.ports.vector.fetch(scope, &id.to_string()),
            )
            .await;
        match fetched {
            Ok(Some(record)) => Ok(record),
            Ok(None) => self
                .compensation
                .pending_record(id)
                .ok_or_else(|| MemoriaError::NotFound(id.to_string())),
            Err(e) => {
                // A record mid-compensation is still readable
                if let Some(record) = self.compensation.pending_record(id) {
                    return Ok(record);
                }
                Err(e)
            }
        }
    }

    /// Page through every record in a scope, ordered by id
    pub async fn get_all(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Page<MemoryRecord>> {
        scope.validate()?;
        let limit = limit.unwrap_or(100).clamp(1, 1000);
        self.with_budget("vector.list", self.ports.vector.list(scope, cursor, limit))
            .await
    }

    /// Remove a record from both backends
    pub async fn delete(&self, scope: &Scope, id: &str) -> Result<()> {
        scope.validate()?;
        let id = id.to_string();
        let key = crate::fingerprint::write_lock_key(scope, &id);
        let holder = Uuid::new_v4().to_string();
        self.with_write_lock(&key, &holder, || async {
            let existing = self.ports.vector.fetch(scope, &id).await?;
            if existing.is_none() && self.compensation.pending_record(&id).is_none() {
                return Err(MemoriaError::NotFound(id.clone()));
            }
            self.ports.vector.delete(scope, &id).await?;
            self.ports.graph.detach_record(scope, &id).await?;
            self.compensation.clear_pending(&id);
            Ok(())
        })
        .await?;
        self.invalidate_scope(scope).await?;
        Ok(())
    }

    // -- shared plumbing ---------------------------------------------------

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.ports.clock.now()
    }

    pub(crate) fn register_scope(&self, scope: &Scope) {
        self.known_scopes
            .entry(scope_hash(scope))
            .or_insert_with(|| scope.clone());
    }

    /// Enforce the per-port call budget; elapsing maps to a retriable timeout
    pub(crate) async fn with_budget<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.port_budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(MemoriaError::Timeout(format!(
                "{} exceeded the port budget",
                what
            ))),
        }
    }

    pub(crate) async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        match self.ports.cache.get(key).await {
            Ok(value) => Ok(value),
            Err(e) => match self.config.deployment {
                DeploymentMode::Clustered => {
                    Err(MemoriaError::CacheUnavailable(e.to_string()))
                }
                DeploymentMode::SingleNode => {
                    warn!(error = %e, "cache get failed, using local fallback");
                    crate::ports::Cache::get(&self.fallback_cache, key).await
                }
            },
        }
    }

    pub(crate) async fn cache_set(&self, key: &str, value: &str) -> Result<()> {
        let ttl = std::time::Duration::from_secs(self.config.search.cache_ttl_secs);
        match self.ports.cache.set(key, value, ttl).await {
            Ok(()) => Ok(()),
            Err(e) => match self.config.deployment {
                DeploymentMode::Clustered => {
                    Err(MemoriaError::CacheUnavailable(e.to_string()))
                }
                DeploymentMode::SingleNode => {
                    warn!(error = %e, "cache set failed, using local fallback");
                    crate::ports::Cache::set(&self.fallback_cache, key, value, ttl).await
                }
            },
        }
    }

    /// Invalidate every cached read in the scope and announce it
    pub(crate) async fn invalidate_scope(&self, scope: &Scope) -> Result<()> {
        let prefix = scope_cache_prefix(scope);
        let removed = match self.ports.cache.invalidate_prefix(&prefix).await {
            Ok(n) => n,
            Err(e) => match self.config.deployment {
                DeploymentMode::Clustered => {
                    return Err(MemoriaError::CacheUnavailable(e.to_string()))
                }
                DeploymentMode::SingleNode => {
                    warn!(error = %e, "cache invalidation failed, using local fallback");
                    crate::ports::Cache::invalidate_prefix(&self.fallback_cache, &prefix).await?
                }
            },
        };
        debug!(scope = %scope_hash(scope), removed, "scope cache invalidated");
        self.publish(
            ChangeEvent::new(Topic::CacheInvalidated, scope_hash(scope), self.now())
                .with_extra(serde_json::json!({ "entries": removed })),
        )
        .await
    }

    pub(crate) async fn publish(&self, event: ChangeEvent) -> Result<()> {
        match self.ports.pubsub.publish(event).await {
            Ok(()) => Ok(()),
            Err(e) => match self.config.deployment {
                DeploymentMode::Clustered => Err(MemoriaError::PubSubUnavailable(e.to_string())),
                DeploymentMode::SingleNode => {
                    warn!(error = %e, "event publish failed, dropping");
                    Ok(())
                }
            },
        }
    }

    pub(crate) async fn lock_try_acquire(&self, key: &str, holder: &str) -> Result<bool> {
        match self
            .ports
            .locks
            .try_acquire(key, holder, self.config.lock_ttl)
            .await
        {
            Ok(acquired) => Ok(acquired),
            Err(e) => match self.config.deployment {
                DeploymentMode::Clustered => {
                    Err(MemoriaError::LockManagerUnavailable(e.to_string()))
                }
                DeploymentMode::SingleNode => {
                    warn!(error = %e, "lock manager failed, using local fallback");
                    crate::ports::LockManager::try_acquire(
                        &self.fallback_locks,
                        key,
                        holder,
                        self.config.lock_ttl,
                    )
                    .await
                }
            },
        }
    }

    pub(crate) async fn lock_release(&self, key: &str, holder: &str) {
        if let Err(e) = self.ports.locks.release(key, holder).await {
            warn!(error = %e, key, "lock release failed");
        }
        let _ = crate::ports::LockManager::release(&self.fallback_locks, key, holder).await;
    }

    /// Serialize a critical section on one lock key, with bounded
    /// acquisition retry. Exhausting the budget yields `Contended`.
    pub(crate) async fn with_write_lock<T, F, Fut>(
        &self,
        key: &str,
        holder: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let started = std::time::Instant::now();
        loop {
            if self.lock_try_acquire(key, holder).await? {
                break;
            }
            if started.elapsed() >= self.config.lock_acquire_budget {
                return Err(MemoriaError::Contended(format!("lock busy: {}", key)));
            }
            tokio::time::sleep(self.config.lock_retry_interval).await;
        }
        let result = f().await;
        self.lock_release(key, holder).await;
        result
    }
}
