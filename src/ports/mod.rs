//! Port interfaces for external collaborators
//!
//! The engine touches the outside world only through these traits. Each port
//! call may suspend; implementations are expected to be network clients, but
//! the in-process adapters in [`local`] and [`memory`] make single-node
//! deployments and tests self-contained.

pub mod local;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{MemoriaError, Result};
use crate::events::ChangeEvent;
use crate::types::{MemoryId, MemoryRecord, Page, Scope, SearchFilter};

pub use local::{LocalCache, LocalLockManager, LocalPubSub, ManualClock, SystemClock};
pub use memory::{HashingEmbedder, MemoryGraphStore, MemoryVectorStore, RuleExtractor};

/// A fixed-dimension embedding plus its dimensionality
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub dimensions: usize,
}

/// Entities and relations extracted from a piece of text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub entities: Vec<String>,
    pub relations: Vec<crate::types::RelationTriple>,
}

/// Produces a fixed-dimension vector from text. Opaque to the engine.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;
}

/// Produces (entity, relation, entity) triples from text. Errors are
/// non-fatal on the write path; the record is stored with an empty graph
/// payload.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Extraction>;
}

/// Vector index plus record payload store
///
/// The vector store owns the full record payload (minus the graph's entity
/// nodes), so it also serves rehydration, pagination, and status mutations.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace a record and its vector; returns the store's
    /// embedding handle (never assumed to equal the record id)
    async fn upsert(
        &self,
        scope: &Scope,
        id: &MemoryId,
        vector: &[f32],
        record: &MemoryRecord,
    ) -> Result<String>;

    async fn delete(&self, scope: &Scope, id: &MemoryId) -> Result<()>;

    /// Nearest-neighbor search; scores in [0, 1], higher = closer
    async fn search(
        &self,
        scope: &Scope,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<(MemoryId, f32)>>;

    /// Rehydrate one record by id
    async fn fetch(&self, scope: &Scope, id: &MemoryId) -> Result<Option<MemoryRecord>>;

    /// Page through a scope's records ordered by id; cursor is the last id
    /// of the previous page
    async fn list(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<MemoryRecord>>;

    /// Persist status/version/flag mutations; content itself is immutable
    async fn update_metadata(&self, scope: &Scope, record: &MemoryRecord) -> Result<()>;

    /// Liveness probe used for the startup capability check
    async fn available(&self) -> bool {
        true
    }
}

/// Per-entity relation summary returned by [`GraphStore::relation_summary`]
#[derive(Debug, Clone, Default)]
pub struct EntityRelationSummary {
    /// Records that reference the entity
    pub mentions: Vec<MemoryId>,
    /// Neighboring entity -> shared record count
    pub related: Vec<(String, usize)>,
    /// Relation type -> edge count
    pub relation_types: std::collections::BTreeMap<String, usize>,
}

/// Knowledge graph of entity nodes and typed relation edges, each edge tied
/// to the record that asserted it
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Idempotently ensure an entity node exists in the scope
    async fn merge_entity(&self, scope: &Scope, name: &str, record_id: &MemoryId) -> Result<()>;

    /// Idempotently ensure a typed edge exists, attributed to a record
    async fn merge_relation(
        &self,
        scope: &Scope,
        src: &str,
        relation: &str,
        dst: &str,
        record_id: &MemoryId,
    ) -> Result<()>;

    /// Remove every node/edge attribution for a record
    async fn detach_record(&self, scope: &Scope, id: &MemoryId) -> Result<()>;

    /// Term search over the graph; scores reflect subgraph proximity
    async fn search(
        &self,
        scope: &Scope,
        query_terms: &[String],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<(MemoryId, f32)>>;

    /// Records implicated within `max_hops` of the entity
    async fn neighborhood(
        &self,
        scope: &Scope,
        entity: &str,
        max_hops: usize,
    ) -> Result<Vec<MemoryId>>;

    /// Relationship profile of one entity
    async fn relation_summary(&self, scope: &Scope, entity: &str)
        -> Result<EntityRelationSummary>;

    /// Liveness probe used for the startup capability check
    async fn available(&self) -> bool {
        true
    }
}

/// Opaque value cache with prefix invalidation
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize>;

    /// True when the cache is shared between processes
    fn is_distributed(&self) -> bool {
        false
    }
}

/// Fire-and-forget event publication
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, event: ChangeEvent) -> Result<()>;

    fn is_distributed(&self) -> bool {
        false
    }
}

/// Distributed lock manager
///
/// Locks are re-entrant per holder, expire after their TTL, and guarantee at
/// most one holder at a time.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns true when the lock was acquired (or re-entered)
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Releases only when the holder still owns the lock
    async fn release(&self, key: &str, holder: &str) -> Result<()>;

    fn is_distributed(&self) -> bool {
        false
    }
}

/// Wall clock, injected so tests control time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Acquire a lock with bounded retry, run `f`, release.
///
/// Exhausting the acquisition budget yields `Contended` without running `f`.
pub async fn with_lock<T, F, Fut>(
    locks: &dyn LockManager,
    key: &str,
    holder: &str,
    ttl: Duration,
    retry_interval: Duration,
    acquire_budget: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = std::time::Instant::now();
    loop {
        if locks.try_acquire(key, holder, ttl).await? {
            break;
        }
        if started.elapsed() >= acquire_budget {
            return Err(MemoriaError::Contended(format!("lock busy: {}", key)));
        }
        tokio::time::sleep(retry_interval).await;
    }
    let result = f().await;
    locks.release(key, holder).await?;
    result
}

/// The full set of collaborator handles the engine operates through
#[derive(Clone)]
pub struct Ports {
    pub embedder: Arc<dyn Embedder>,
    pub extractor: Arc<dyn Extractor>,
    pub vector: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub cache: Arc<dyn Cache>,
    pub pubsub: Arc<dyn PubSub>,
    pub locks: Arc<dyn LockManager>,
    pub clock: Arc<dyn Clock>,
}

impl Ports {
    /// Fully in-process port set for single-node deployments and tests
    pub fn in_process(clock: Arc<dyn Clock>) -> Self {
        Self {
            embedder: Arc::new(HashingEmbedder::default()),
            extractor: Arc::new(RuleExtractor::default()),
            vector: Arc::new(MemoryVectorStore::new()),
            graph: Arc::new(MemoryGraphStore::new()),
            cache: Arc::new(LocalCache::new()),
            pubsub: Arc::new(LocalPubSub::new()),
            locks: Arc::new(LocalLockManager::new()),
            clock,
        }
    }
}
