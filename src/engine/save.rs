//! Dual-write coordinator
//!
//! Every write is serialized on its `(scope, fingerprint)` lock key, checked
//! for idempotency and conflicts, then written to the vector store and the
//! knowledge graph. A write that lands in only one backend still succeeds:
//! it returns `degraded = true` and hands completion to the compensation
//! queue.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MemoriaError, Result};
use crate::events::{ChangeEvent, Topic};
use crate::fingerprint::{fingerprint, scope_hash, write_lock_key};
use crate::ports::Extraction;
use crate::types::{
    Category, CategoryData, MemoryId, MemoryRecord, MilestoneRequest, RecordStatus, SaveRequest,
    SaveResult, Scope,
};

use super::compensation::{CompensationAction, CompensationTask};
use super::MemoryEngine;

/// Fully resolved write, shared by save, milestone, and conflict-resolution
/// paths
pub(crate) struct WriteSpec {
    pub content: String,
    pub category: Category,
    pub data: CategoryData,
    pub confidence: u8,
    pub source: String,
    pub tags: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub extra_metadata: BTreeMap<String, String>,
    /// Conflict ids carried onto the new record (conflict resolution sets
    /// these explicitly; normal saves discover them)
    pub conflict_with: Vec<MemoryId>,
    /// Normal saves detect conflicts; the resolution path must not
    pub detect_conflicts: bool,
}

impl MemoryEngine {
    /// Persist one memory across both backends
    pub async fn save(&self, scope: &Scope, request: SaveRequest) -> Result<SaveResult> {
        let spec = self.spec_from_request(scope, request)?;
        let (result, _) = self.write_record(scope, spec).await?;
        Ok(result)
    }

    /// `save` with mandatory provenance and high confidence
    pub async fn save_verified(&self, scope: &Scope, request: SaveRequest) -> Result<SaveResult> {
        match request.source.as_deref() {
            Some(source) if !source.trim().is_empty() => {}
            _ => {
                return Err(MemoriaError::InvalidInput(
                    "save_verified requires a source".to_string(),
                ))
            }
        }
        match request.confidence {
            Some(confidence) if confidence >= 7 => {}
            _ => {
                return Err(MemoriaError::InvalidInput(
                    "save_verified requires confidence >= 7".to_string(),
                ))
            }
        }
        self.save(scope, request).await
    }

    /// Record a typed project milestone. Milestones never expire and their
    /// impact level doubles as the record confidence.
    pub async fn save_milestone(
        &self,
        scope: &Scope,
        request: MilestoneRequest,
    ) -> Result<MemoryRecord> {
        if !(1..=10).contains(&request.impact_level) {
            return Err(MemoriaError::InvalidInput(format!(
                "impact_level must be 1..10, got {}",
                request.impact_level
            )));
        }
        if request.content.trim().is_empty() {
            return Err(MemoriaError::InvalidInput(
                "milestone content must not be empty".to_string(),
            ));
        }
        let mut tags = request.tags.clone();
        for extra in ["milestone", request.milestone_type.as_str()] {
            if !tags.iter().any(|t| t == extra) {
                tags.push(extra.to_string());
            }
        }
        let spec = WriteSpec {
            content: request.content,
            category: Category::Milestone,
            data: CategoryData::Milestone {
                milestone_type: request.milestone_type,
                impact_level: request.impact_level,
            },
            confidence: request.impact_level,
            source: "project_milestone".to_string(),
            tags,
            expires_at: None,
            extra_metadata: BTreeMap::new(),
            conflict_with: Vec::new(),
            detect_conflicts: true,
        };
        let (_, record) = self.write_record(scope, spec).await?;
        Ok(record)
    }

    /// Validate a caller request and fill in category defaults
    fn spec_from_request(&self, scope: &Scope, request: SaveRequest) -> Result<WriteSpec> {
        scope.validate()?;
        if request.content.trim().is_empty() {
            return Err(MemoriaError::InvalidInput(
                "content must not be empty".to_string(),
            ));
        }
        if let Some(confidence) = request.confidence {
            if !(1..=10).contains(&confidence) {
                return Err(MemoriaError::InvalidInput(format!(
                    "confidence must be 1..10, got {}",
                    confidence
                )));
            }
        }
        if request.category == Category::Milestone {
            return Err(MemoriaError::InvalidInput(
                "milestones go through save_milestone".to_string(),
            ));
        }
        let now = self.now();
        // The caller's expiry wins over the category default; a past instant
        // is legal and picked up by the next sweep.
        let expires_at = request
            .expires_at
            .or_else(|| request.expires_in_days.map(|d| now + Duration::days(d)))
            .or_else(|| {
                request
                    .category
                    .default_ttl_days()
                    .map(|d| now + Duration::days(d))
            });
        Ok(WriteSpec {
            confidence: request
                .confidence
                .unwrap_or_else(|| request.category.default_confidence()),
            content: request.content,
            category: request.category,
            data: CategoryData::General,
            source: request.source.unwrap_or_else(|| "user_input".to_string()),
            tags: request.tags,
            expires_at,
            extra_metadata: request.extra_metadata,
            conflict_with: Vec::new(),
            detect_conflicts: true,
        })
    }

    /// The locked dual-write sequence shared by every write path
    pub(crate) async fn write_record(
        &self,
        scope: &Scope,
        spec: WriteSpec,
    ) -> Result<(SaveResult, MemoryRecord)> {
        scope.validate()?;
        let id = fingerprint(scope, &spec.content);
        let lock_key = write_lock_key(scope, &id);
        let holder = Uuid::new_v4().to_string();
        self.with_write_lock(&lock_key, &holder, || self.write_locked(scope, id.clone(), spec))
            .await
    }

    async fn write_locked(
        &self,
        scope: &Scope,
        id: MemoryId,
        spec: WriteSpec,
    ) -> Result<(SaveResult, MemoryRecord)> {
        self.register_scope(scope);

        // Idempotency: the fingerprint makes a same-content re-save a no-op.
        if let Some(existing) = self.existing_record(scope, &id).await {
            debug!(id = %id, "idempotent re-save");
            self.stats.idempotent_save();
            let result = SaveResult {
                id: id.clone(),
                status: existing.status,
                created: false,
                conflicts: existing.conflict_with.clone(),
                degraded: existing.degraded,
            };
            return Ok((result, existing));
        }

        // Parallel fanout to the embedder and the extractor. The embedder is
        // load-bearing; the extractor is not.
        let (embed_result, extract_result) = tokio::join!(
            self.with_budget("embedder.embed", self.ports.embedder.embed(&spec.content)),
            self.with_budget(
                "extractor.extract",
                self.ports.extractor.extract(&spec.content)
            ),
        );
        let embedding = match embed_result {
            Ok(embedding) => embedding,
            Err(e @ MemoriaError::Timeout(_)) => return Err(e),
            Err(e) => return Err(MemoriaError::EmbedderUnavailable(e.to_string())),
        };
        let (extraction, extraction_failed) = match extract_result {
            Ok(extraction) => (extraction, false),
            Err(e) => {
                warn!(id = %id, error = %e, "extractor failed, writing with empty graph payload");
                (Extraction::default(), true)
            }
        };

        // Advisory conflict pass against near neighbors in the same category
        let peers = if spec.detect_conflicts {
            self.detect_conflicts(scope, &id, &spec.content, spec.category, &spec.tags, &embedding.vector)
                .await
        } else {
            Vec::new()
        };
        let mut conflict_with = spec.conflict_with.clone();
        for peer in &peers {
            if !conflict_with.contains(&peer.id) {
                conflict_with.push(peer.id.clone());
            }
        }

        let now = self.now();
        let status = if peers.is_empty() {
            RecordStatus::Active
        } else {
            RecordStatus::Conflicted
        };
        let mut record = MemoryRecord {
            id: id.clone(),
            scope: scope.clone(),
            content: spec.content,
            embedding_ref: None,
            entities: extraction.entities,
            relations: extraction.relations,
            category: spec.category,
            data: spec.data,
            confidence: spec.confidence,
            source: spec.source,
            tags: spec.tags,
            created_at: now,
            updated_at: now,
            expires_at: spec.expires_at,
            version: 1,
            status,
            superseded_by: None,
            conflict_with: conflict_with.clone(),
            extra_metadata: spec.extra_metadata,
            degraded: false,
            extraction_failed,
        };

        // Dual write: vector first, then graph. Either leg may fail alone;
        // the compensation queue owns the missing one.
        let vector_result = self
            .with_budget(
                "vector.upsert",
                self.ports
                    .vector
                    .upsert(scope, &id, &embedding.vector, &record),
            )
            .await;
        let graph_result = self
            .with_budget("graph.merge", self.write_graph_payload(scope, &record))
            .await;

        let degraded = match (&vector_result, &graph_result) {
            (Ok(embedding_ref), Ok(())) => {
                record.embedding_ref = Some(embedding_ref.clone());
                if let Err(e) = self.ports.vector.update_metadata(scope, &record).await {
                    warn!(id = %id, error = %e, "embedding_ref persist failed");
                }
                false
            }
            (Ok(embedding_ref), Err(graph_err)) => {
                warn!(id = %id, error = %graph_err, "graph leg failed, enqueueing compensation");
                record.embedding_ref = Some(embedding_ref.clone());
                record.degraded = true;
                if let Err(e) = self.ports.vector.update_metadata(scope, &record).await {
                    warn!(id = %id, error = %e, "degraded flag persist failed");
                }
                self.enqueue_compensation(
                    scope,
                    &record,
                    embedding.vector.clone(),
                    CompensationAction::RetryGraph,
                )
                .await?;
                true
            }
            (Err(vector_err), Ok(())) => {
                warn!(id = %id, error = %vector_err, "vector leg failed, enqueueing compensation");
                record.degraded = true;
                self.enqueue_compensation(
                    scope,
                    &record,
                    embedding.vector.clone(),
                    CompensationAction::RetryVector,
                )
                .await?;
                true
            }
            (Err(_), Err(graph_err)) => {
                // Both backends refused the write; nothing to compensate.
                let vector_err = vector_result.as_ref().err().map(|e| e.to_string());
                return Err(MemoriaError::VectorStoreUnavailable(format!(
                    "dual write failed: vector: {}; graph: {}",
                    vector_err.unwrap_or_default(),
                    graph_err
                )));
            }
        };

        // Flag the older peers in a second pass, then announce the write.
        self.flag_conflicted_peers(scope, &id, &peers).await;

        let topic = if peers.is_empty() {
            Topic::MemoryCreated
        } else {
            Topic::MemoryConflicted
        };
        self.publish(
            ChangeEvent::new(topic, scope_hash(scope), now)
                .with_id(id.clone())
                .with_extra(serde_json::json!({
                    "category": record.category.as_str(),
                    "conflict_with": conflict_with,
                })),
        )
        .await?;

        self.invalidate_scope(scope).await?;

        self.stats.save();
        self.stats.conflicts(peers.len() as u64);
        self.note_upcoming_expiry(scope, record.expires_at);

        let result = SaveResult {
            id,
            status: record.status,
            created: true,
            conflicts: conflict_with,
            degraded,
        };
        Ok((result, record))
    }

    /// Look up an existing record for the idempotency check, tolerating a
    /// vector outage (a record mid-compensation still counts)
    async fn existing_record(&self, scope: &Scope, id: &MemoryId) -> Option<MemoryRecord> {
        match self
            .with_budget("vector.fetch", self.ports.vector.fetch(scope, id))
            .await
        {
            Ok(Some(record)) => Some(record),
            _ => self.compensation.pending_record(id),
        }
    }

    async fn write_graph_payload(&self, scope: &Scope, record: &MemoryRecord) -> Result<()> {
        for entity in &record.entities {
            self.ports
                .graph
                .merge_entity(scope, entity, &record.id)
                .await?;
        }
        for relation in &record.relations {
            self.ports
                .graph
                .merge_relation(
                    scope,
                    &relation.src,
                    &relation.relation,
                    &relation.dst,
                    &record.id,
                )
                .await?;
        }
        Ok(())
    }

    async fn enqueue_compensation(
        &self,
        scope: &Scope,
        record: &MemoryRecord,
        embedding: Vec<f32>,
        action: CompensationAction,
    ) -> Result<()> {
        self.stats.compensation_enqueued();
        self.compensation
            .enqueue(CompensationTask {
                scope: scope.clone(),
                record: record.clone(),
                embedding,
                action,
                attempt: 0,
            })
            .await
    }
}
