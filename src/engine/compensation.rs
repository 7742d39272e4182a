//! Compensation queue for partial dual-write failures
//!
//! A write that lands in only one backend enqueues a task here; workers
//! retry the missing leg with exponential backoff until it completes or the
//! attempt budget runs out. While a task is pending, the full record is held
//! so reads can still rehydrate it even when the vector leg is the one
//! missing.

use async_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CompensationConfig;
use crate::error::{MemoriaError, Result};
use crate::events::{ChangeEvent, Topic};
use crate::fingerprint::scope_hash;
use crate::ports::Ports;
use crate::types::{MemoryId, MemoryRecord, Scope};

use super::Stats;
use std::sync::Arc;

/// Which backend leg still needs to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationAction {
    RetryGraph,
    RetryVector,
}

/// One pending reconciliation job, keyed by record id
#[derive(Debug, Clone)]
pub struct CompensationTask {
    pub scope: Scope,
    pub record: MemoryRecord,
    pub embedding: Vec<f32>,
    pub action: CompensationAction,
    /// Zero-based retry attempt, drives the backoff delay
    pub attempt: u32,
}

/// In-process compensation queue
///
/// Single producer per record (the save path holds the write lock), multiple
/// consumer workers. Loss on process exit is acceptable for single-node
/// deployments.
pub struct CompensationQueue {
    sender: Sender<CompensationTask>,
    receiver: Receiver<CompensationTask>,
    /// Records awaiting completion, for read-path rehydration
    pending: DashMap<MemoryId, MemoryRecord>,
}

impl CompensationQueue {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(10_000);
        Self {
            sender,
            receiver,
            pending: DashMap::new(),
        }
    }

    pub async fn enqueue(&self, task: CompensationTask) -> Result<()> {
        self.pending
            .insert(task.record.id.clone(), task.record.clone());
        self.sender
            .send(task)
            .await
            .map_err(|e| MemoriaError::Internal(format!("compensation queue send: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Record still owned by the queue, if any
    pub fn pending_record(&self, id: &str) -> Option<MemoryRecord> {
        self.pending.get(id).map(|r| r.clone())
    }

    pub(crate) fn receiver(&self) -> Receiver<CompensationTask> {
        self.receiver.clone()
    }

    pub(crate) fn clear_pending(&self, id: &str) {
        self.pending.remove(id);
    }
}

impl Default for CompensationQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Background worker draining the compensation queue
pub struct CompensationWorker {
    ports: Ports,
    queue: Arc<CompensationQueue>,
    config: CompensationConfig,
    stats: Arc<Stats>,
}

impl CompensationWorker {
    pub(crate) fn new(
        ports: Ports,
        queue: Arc<CompensationQueue>,
        config: CompensationConfig,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            ports,
            queue,
            config,
            stats,
        }
    }

    /// Run until the queue is closed (call in a spawned task)
    pub async fn run(&self) {
        let receiver = self.queue.receiver();
        while let Ok(task) = receiver.recv().await {
            let delay = self.config.backoff_for(task.attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.process(task).await;
        }
    }

    /// Process every currently queued task exactly once, without backoff
    /// sleeps. Used by tests and by shutdown draining.
    pub async fn drain(&self) {
        let receiver = self.queue.receiver();
        let mut budget = receiver.len();
        while budget > 0 {
            match receiver.try_recv() {
                Ok(task) => self.process(task).await,
                Err(_) => break,
            }
            budget -= 1;
        }
    }

    async fn process(&self, mut task: CompensationTask) {
        match self.attempt(&task).await {
            Ok(()) => {
                // The missing leg landed; clear the degraded flag so the
                // next read sees a clean record.
                let mut record = task.record.clone();
                record.degraded = false;
                if let Err(e) = self
                    .ports
                    .vector
                    .update_metadata(&task.scope, &record)
                    .await
                {
                    warn!(id = %record.id, error = %e, "compensation completed but flag clear failed");
                } else {
                    debug!(id = %record.id, action = ?task.action, "compensation completed");
                }
                self.queue.clear_pending(&record.id);
            }
            Err(e) => {
                task.attempt += 1;
                if task.attempt >= self.config.max_attempts {
                    self.stats.compensation_failed();
                    warn!(
                        id = %task.record.id,
                        attempts = task.attempt,
                        error = %e,
                        "compensation exhausted its attempts"
                    );
                    let event = ChangeEvent::new(
                        Topic::CompensationFailed,
                        scope_hash(&task.scope),
                        self.ports.clock.now(),
                    )
                    .with_id(task.record.id.clone())
                    .with_extra(serde_json::json!({ "reason": e.to_string() }));
                    if let Err(publish_err) = self.ports.pubsub.publish(event).await {
                        warn!(error = %publish_err, "compensation failure event dropped");
                    }
                    // The record stays degraded and stays pending so reads
                    // can keep returning it.
                } else {
                    debug!(id = %task.record.id, attempt = task.attempt, error = %e, "compensation retry scheduled");
                    if let Err(send_err) = self.queue.enqueue(task).await {
                        warn!(error = %send_err, "compensation re-enqueue failed");
                    }
                }
            }
        }
    }

    async fn attempt(&self, task: &CompensationTask) -> Result<()> {
        match task.action {
            CompensationAction::RetryGraph => {
                let record = &task.record;
                for entity in &record.entities {
                    self.ports
                        .graph
                        .merge_entity(&task.scope, entity, &record.id)
                        .await?;
                }
                for relation in &record.relations {
                    self.ports
                        .graph
                        .merge_relation(
                            &task.scope,
                            &relation.src,
                            &relation.relation,
                            &relation.dst,
                            &record.id,
                        )
                        .await?;
                }
                Ok(())
            }
            CompensationAction::RetryVector => {
                let mut record = task.record.clone();
                record.degraded = false;
                self.ports
                    .vector
                    .upsert(&task.scope, &record.id.clone(), &task.embedding, &record)
                    .await?;
                Ok(())
            }
        }
    }
}
