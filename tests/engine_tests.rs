//! End-to-end engine tests against the in-process port adapters
//!
//! Run with: cargo test --test engine_tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use memoria::config::EngineConfig;
use memoria::engine::MemoryEngine;
use memoria::error::MemoriaError;
use memoria::events::{ChangeEvent, Topic};
use memoria::fingerprint::{fingerprint, write_lock_key};
use memoria::ports::{
    Clock, HashingEmbedder, LocalCache, LocalLockManager, LocalPubSub, LockManager, ManualClock,
    MemoryGraphStore, MemoryVectorStore, Ports, RuleExtractor,
};
use memoria::types::{
    Category, MilestoneRequest, MilestoneType, ProjectPhase, RecordStatus, SaveRequest,
    Scope, SearchFilter,
};

struct Harness {
    engine: Arc<MemoryEngine>,
    clock: Arc<ManualClock>,
    vector: Arc<MemoryVectorStore>,
    graph: Arc<MemoryGraphStore>,
    locks: Arc<LocalLockManager>,
    events: broadcast::Receiver<ChangeEvent>,
}

impl Harness {
    /// Drain every published event so far and count one topic
    fn count_events(&mut self, topic: Topic) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            if event.topic == topic {
                count += 1;
            }
        }
        count
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

async fn harness_with(tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let vector = Arc::new(MemoryVectorStore::new());
    let graph = Arc::new(MemoryGraphStore::new());
    let pubsub = Arc::new(LocalPubSub::new());
    let locks = Arc::new(LocalLockManager::new());
    let events = pubsub.subscribe();

    let ports = Ports {
        embedder: Arc::new(HashingEmbedder::default()),
        extractor: Arc::new(RuleExtractor::default()),
        vector: vector.clone(),
        graph: graph.clone(),
        cache: Arc::new(LocalCache::new()),
        pubsub,
        locks: locks.clone(),
        clock: clock.clone(),
    };

    let mut config = EngineConfig::default();
    // The hashing embedder measures lexical overlap, not semantics, so the
    // conflict threshold sits lower than the production default.
    config.conflict.similarity_threshold = 0.6;
    // Tests drive compensation by hand for determinism
    config.compensation.workers = 0;
    config.compensation.base_backoff = Duration::ZERO;
    tweak(&mut config);

    let engine = MemoryEngine::start(ports, config).await;
    Harness {
        engine,
        clock,
        vector,
        graph,
        locks,
        events,
    }
}

fn project_scope() -> Scope {
    Scope::new("t1", "u1").with_project("p1")
}

fn save_request(content: &str, category: Category, confidence: u8, source: &str) -> SaveRequest {
    SaveRequest {
        content: content.to_string(),
        category,
        confidence: Some(confidence),
        source: Some(source.to_string()),
        ..Default::default()
    }
}

// ============================================================================
// DUAL-WRITE SCENARIOS
// ============================================================================

#[tokio::test]
async fn happy_path_dual_write() {
    let mut h = harness().await;
    let scope = project_scope();

    let result = h
        .engine
        .save(
            &scope,
            save_request(
                "The service uses PostgreSQL",
                Category::Architecture,
                9,
                "code_review",
            ),
        )
        .await
        .unwrap();

    assert!(result.created);
    assert!(!result.degraded);
    assert_eq!(result.status, RecordStatus::Active);
    assert!(result.conflicts.is_empty());

    // Both backends hold the record
    let record = h.engine.get(&scope, &result.id).await.unwrap();
    assert_eq!(record.content, "The service uses PostgreSQL");
    assert_eq!(record.confidence, 9);
    assert_eq!(record.source, "code_review");
    assert!(record.embedding_ref.is_some());
    assert_eq!(h.vector.record_count(&scope), 1);
    assert_eq!(h.graph.mention_count(&scope, "postgresql"), 1);

    assert_eq!(h.count_events(Topic::MemoryCreated), 1);
}

#[tokio::test]
async fn idempotent_resave() {
    let mut h = harness().await;
    let scope = project_scope();
    let request = save_request(
        "The service uses PostgreSQL",
        Category::Architecture,
        9,
        "code_review",
    );

    let first = h.engine.save(&scope, request.clone()).await.unwrap();
    assert_eq!(h.count_events(Topic::MemoryCreated), 1);

    let second = h.engine.save(&scope, request).await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(!second.created);
    assert_eq!(h.vector.record_count(&scope), 1);
    // No additional creation event for the no-op write
    assert_eq!(h.count_events(Topic::MemoryCreated), 0);

    let stats = h.engine.stats();
    assert_eq!(stats.saves, 1);
    assert_eq!(stats.idempotent_saves, 1);
}

#[tokio::test]
async fn conflicting_write_flags_both_records() {
    let mut h = harness().await;
    let scope = project_scope();

    let first = h
        .engine
        .save(
            &scope,
            save_request(
                "The service uses PostgreSQL",
                Category::Architecture,
                9,
                "code_review",
            ),
        )
        .await
        .unwrap();

    let second = h
        .engine
        .save(
            &scope,
            save_request(
                "The service uses MongoDB",
                Category::Architecture,
                8,
                "issue_123",
            ),
        )
        .await
        .unwrap();

    assert_eq!(second.status, RecordStatus::Conflicted);
    assert_eq!(second.conflicts, vec![first.id.clone()]);

    // Second pass flagged the older peer too
    let older = h.engine.get(&scope, &first.id).await.unwrap();
    assert_eq!(older.status, RecordStatus::Conflicted);
    assert!(older.conflict_with.contains(&second.id));

    assert!(h.count_events(Topic::MemoryConflicted) >= 2);
}

#[tokio::test]
async fn conflict_resolution_deprecates_originals() {
    let mut h = harness().await;
    let scope = project_scope();

    let first = h
        .engine
        .save(
            &scope,
            save_request(
                "The service uses PostgreSQL",
                Category::Architecture,
                9,
                "code_review",
            ),
        )
        .await
        .unwrap();
    let second = h
        .engine
        .save(
            &scope,
            save_request(
                "The service uses MongoDB",
                Category::Architecture,
                8,
                "issue_123",
            ),
        )
        .await
        .unwrap();

    let ids = vec![first.id.clone(), second.id.clone()];
    let resolved = h
        .engine
        .resolve_conflict(
            &scope,
            &ids,
            "The service uses PostgreSQL as primary and MongoDB for logs.",
            "arch review 2025-Q1",
        )
        .await
        .unwrap();

    assert_eq!(resolved.confidence, 10);
    assert_eq!(resolved.status, RecordStatus::Active);
    assert_eq!(resolved.source, "conflict_resolution");
    assert_eq!(resolved.conflict_with, ids);
    assert_eq!(
        resolved.extra_metadata.get("resolution_reason").unwrap(),
        "arch review 2025-Q1"
    );

    for (id, original_version) in [(&first.id, 1u32), (&second.id, 1u32)] {
        let original = h.engine.get(&scope, id).await.unwrap();
        assert_eq!(original.status, RecordStatus::Deprecated);
        assert_eq!(original.superseded_by.as_ref(), Some(&resolved.id));
        assert_eq!(original.version, original_version + 1);
    }

    assert_eq!(h.count_events(Topic::MemoryDeprecated), 2);

    // Quality-filtered reads only surface the consolidated record
    let context = h
        .engine
        .get_context(&scope, "the service database choice", Some(7), None)
        .await
        .unwrap();
    assert_eq!(context.results.len(), 1);
    assert_eq!(context.results[0].memory.id, resolved.id);

    // Running the same resolution again fails: inputs are deprecated now
    let again = h
        .engine
        .resolve_conflict(&scope, &ids, "Completely new consolidated text here.", "retry")
        .await;
    assert!(matches!(again, Err(MemoriaError::ConflictUnresolved(_))));
}

#[tokio::test]
async fn graph_outage_degrades_write_and_compensates() {
    let mut h = harness().await;
    let scope = project_scope();

    h.graph.set_available(false);
    let result = h
        .engine
        .save(
            &scope,
            save_request("User Alice leads team Gamma.", Category::Generic, 7, "chat"),
        )
        .await
        .unwrap();

    assert!(result.created);
    assert!(result.degraded);
    assert_eq!(h.vector.record_count(&scope), 1);
    assert_eq!(h.graph.mention_count(&scope, "alice"), 0);
    assert_eq!(h.engine.compensation_len(), 1);
    assert!(h.engine.get(&scope, &result.id).await.unwrap().degraded);

    // Graph store recovers; the retry completes and the flag clears
    h.graph.set_available(true);
    h.engine.drain_compensation().await;

    assert_eq!(h.engine.compensation_len(), 0);
    assert_eq!(h.graph.mention_count(&scope, "alice"), 1);
    let record = h.engine.get(&scope, &result.id).await.unwrap();
    assert!(!record.degraded);
    assert_eq!(h.count_events(Topic::CompensationFailed), 0);
}

#[tokio::test]
async fn vector_outage_leaves_graph_only_record() {
    let h = harness().await;
    let scope = project_scope();

    h.vector.set_available(false);
    let result = h
        .engine
        .save(
            &scope,
            save_request("Alice joined team Delta", Category::Generic, 7, "chat"),
        )
        .await
        .unwrap();

    assert!(result.degraded);
    assert_eq!(h.graph.mention_count(&scope, "alice"), 1);
    assert_eq!(h.engine.compensation_len(), 1);

    // Readable through graph search while the vector leg is missing
    let results = h
        .engine
        .search(&scope, "Alice", 5, &SearchFilter::default())
        .await
        .unwrap();
    assert!(results.degraded);
    assert!(results
        .results
        .iter()
        .any(|r| r.memory.id == result.id));

    // Recovery completes the vector leg
    h.vector.set_available(true);
    h.engine.drain_compensation().await;
    let record = h.engine.get(&scope, &result.id).await.unwrap();
    assert!(!record.degraded);
    assert_eq!(h.vector.record_count(&scope), 1);
}

#[tokio::test]
async fn compensation_gives_up_after_max_attempts() {
    let mut h = harness_with(|config| {
        config.compensation.max_attempts = 2;
    })
    .await;
    let scope = project_scope();

    h.graph.set_available(false);
    let result = h
        .engine
        .save(
            &scope,
            save_request("User Bob leads team Delta.", Category::Generic, 7, "chat"),
        )
        .await
        .unwrap();
    assert!(result.degraded);

    // Graph stays down; each drain burns one attempt
    h.engine.drain_compensation().await;
    h.engine.drain_compensation().await;

    assert_eq!(h.engine.compensation_len(), 0);
    assert_eq!(h.count_events(Topic::CompensationFailed), 1);
    assert_eq!(h.engine.stats().compensations_failed, 1);
    // The record is still readable, still flagged
    assert!(h.engine.get(&scope, &result.id).await.unwrap().degraded);
}

// ============================================================================
// EXPIRY
// ============================================================================

#[tokio::test]
async fn expiry_sweep_flips_and_announces_once() {
    let mut h = harness().await;
    let scope = project_scope();
    let now = h.clock.now();

    let request = SaveRequest {
        content: "Deploy pipeline is temporarily frozen".to_string(),
        category: Category::Status,
        confidence: Some(6),
        source: Some("ops".to_string()),
        expires_at: Some(now - chrono::Duration::seconds(1)),
        ..Default::default()
    };
    let result = h.engine.save(&scope, request).await.unwrap();
    // A past expiry is accepted; the record starts active
    assert_eq!(result.status, RecordStatus::Active);

    let report = h.engine.sweep_expired(&scope).await.unwrap();
    assert_eq!(report.expired, vec![result.id.clone()]);
    assert_eq!(
        h.engine.get(&scope, &result.id).await.unwrap().status,
        RecordStatus::Expired
    );
    assert_eq!(h.count_events(Topic::MemoryExpired), 1);

    // Idempotent: a second sweep changes nothing and stays silent
    let report = h.engine.sweep_expired(&scope).await.unwrap();
    assert!(report.expired.is_empty());
    assert_eq!(h.count_events(Topic::MemoryExpired), 0);

    // Hidden from quality-filtered reads
    let context = h
        .engine
        .get_context(&scope, "deploy pipeline frozen", Some(1), None)
        .await
        .unwrap();
    assert!(context.results.is_empty());

    // Still present in the evolution timeline
    let timeline = h.engine.track_evolution(&scope, None).await.unwrap();
    assert!(timeline
        .events
        .iter()
        .any(|e| e.id == result.id && e.status == RecordStatus::Expired));
    assert_eq!(timeline.summary.expired_entries, 1);
}

#[tokio::test]
async fn sweep_respects_future_expiry() {
    let h = harness().await;
    let scope = project_scope();

    let request = SaveRequest {
        content: "Release 2.0 ships next quarter".to_string(),
        category: Category::Status,
        confidence: Some(6),
        expires_in_days: Some(30),
        ..Default::default()
    };
    let result = h.engine.save(&scope, request).await.unwrap();

    let report = h.engine.sweep_expired(&scope).await.unwrap();
    assert!(report.expired.is_empty());

    // Thirty-one days later the record is due
    h.clock.advance(chrono::Duration::days(31));
    let report = h.engine.sweep_expired(&scope).await.unwrap();
    assert_eq!(report.expired, vec![result.id]);
}

// ============================================================================
// VALIDATION & BOUNDARIES
// ============================================================================

#[tokio::test]
async fn confidence_out_of_range_is_rejected() {
    let h = harness().await;
    let scope = project_scope();
    for bad in [0u8, 11] {
        let result = h
            .engine
            .save(
                &scope,
                SaveRequest {
                    content: "x".to_string(),
                    confidence: Some(bad),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(MemoriaError::InvalidInput(_))));
    }
}

#[tokio::test]
async fn save_verified_requires_source_and_confidence() {
    let h = harness().await;
    let scope = project_scope();

    let no_source = h
        .engine
        .save_verified(
            &scope,
            SaveRequest {
                content: "verified fact".to_string(),
                confidence: Some(8),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(no_source, Err(MemoriaError::InvalidInput(_))));

    let low_confidence = h
        .engine
        .save_verified(
            &scope,
            save_request("verified fact", Category::Generic, 6, "review"),
        )
        .await;
    assert!(matches!(low_confidence, Err(MemoriaError::InvalidInput(_))));

    let ok = h
        .engine
        .save_verified(
            &scope,
            save_request("verified fact", Category::Generic, 8, "review"),
        )
        .await
        .unwrap();
    assert!(ok.created);
}

#[tokio::test]
async fn category_defaults_apply_when_caller_is_silent() {
    let h = harness().await;
    let scope = project_scope();

    let result = h
        .engine
        .save(
            &scope,
            SaveRequest {
                content: "Split the ingest path into its own worker".to_string(),
                category: Category::Decision,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let record = h.engine.get(&scope, &result.id).await.unwrap();
    assert_eq!(record.confidence, 8);
    let ttl = record.expires_at.unwrap() - record.created_at;
    assert_eq!(ttl.num_days(), 365);
}

#[tokio::test]
async fn dead_lock_holder_expires() {
    let h = harness_with(|config| {
        config.lock_ttl = Duration::from_millis(4000);
    })
    .await;
    let scope = project_scope();
    let content = "Locked content";
    let key = write_lock_key(&scope, &fingerprint(&scope, content));

    // A dead holder left the lock behind with a short TTL
    assert!(h
        .locks
        .try_acquire(&key, "dead-holder", Duration::from_millis(60))
        .await
        .unwrap());

    // The save retries past the stale TTL and succeeds
    let result = h
        .engine
        .save(&scope, save_request(content, Category::Generic, 5, "chat"))
        .await
        .unwrap();
    assert!(result.created);
}

#[tokio::test]
async fn contended_lock_is_retriable_error() {
    let h = harness_with(|config| {
        config.lock_acquire_budget = Duration::from_millis(40);
        config.lock_retry_interval = Duration::from_millis(5);
    })
    .await;
    let scope = project_scope();
    let content = "Contended content";
    let key = write_lock_key(&scope, &fingerprint(&scope, content));

    assert!(h
        .locks
        .try_acquire(&key, "other-writer", Duration::from_secs(60))
        .await
        .unwrap());

    let result = h
        .engine
        .save(&scope, save_request(content, Category::Generic, 5, "chat"))
        .await;
    match result {
        Err(e @ MemoriaError::Contended(_)) => assert!(e.is_retryable()),
        other => panic!("expected Contended, got {:?}", other.map(|r| r.id)),
    }
}

#[tokio::test]
async fn get_and_get_all_roundtrip() {
    let h = harness().await;
    let scope = project_scope();

    let mut ids = Vec::new();
    for i in 0..7 {
        let result = h
            .engine
            .save(
                &scope,
                save_request(
                    &format!("Fact number {} about the system", i),
                    Category::Generic,
                    5,
                    "chat",
                ),
            )
            .await
            .unwrap();
        ids.push(result.id);
    }

    let missing = h.engine.get(&scope, &"0".repeat(32)).await;
    assert!(matches!(missing, Err(MemoriaError::NotFound(_))));

    let mut seen = 0;
    let mut cursor: Option<String> = None;
    loop {
        let page = h
            .engine
            .get_all(&scope, cursor.as_deref(), Some(3))
            .await
            .unwrap();
        seen += page.items.len();
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }
    assert_eq!(seen, 7);
}

#[tokio::test]
async fn delete_removes_from_both_backends() {
    let h = harness().await;
    let scope = project_scope();

    let result = h
        .engine
        .save(
            &scope,
            save_request("Carol maintains service Hermes", Category::Generic, 5, "chat"),
        )
        .await
        .unwrap();
    assert_eq!(h.graph.mention_count(&scope, "carol"), 1);

    h.engine.delete(&scope, &result.id).await.unwrap();
    assert!(matches!(
        h.engine.get(&scope, &result.id).await,
        Err(MemoriaError::NotFound(_))
    ));
    assert_eq!(h.graph.mention_count(&scope, "carol"), 0);

    let again = h.engine.delete(&scope, &result.id).await;
    assert!(matches!(again, Err(MemoriaError::NotFound(_))));
}

#[tokio::test]
async fn search_results_are_cached() {
    let h = harness().await;
    let scope = project_scope();

    h.engine
        .save(
            &scope,
            save_request("Payment retries use exponential backoff", Category::Solution, 8, "pr"),
        )
        .await
        .unwrap();

    let filter = SearchFilter::default();
    let first = h
        .engine
        .search(&scope, "payment retries backoff", 5, &filter)
        .await
        .unwrap();
    assert_eq!(first.results.len(), 1);

    let second = h
        .engine
        .search(&scope, "payment retries backoff", 5, &filter)
        .await
        .unwrap();
    assert_eq!(second.results.len(), 1);

    let stats = h.engine.stats();
    assert!(stats.cache_hits >= 1);
}

#[tokio::test]
async fn cross_scope_isolation() {
    let h = harness().await;
    let scope_a = Scope::new("t1", "u1").with_project("p1");
    let scope_b = Scope::new("t1", "u2").with_project("p1");

    let saved = h
        .engine
        .save(
            &scope_a,
            save_request("Secret architecture detail", Category::Architecture, 9, "review"),
        )
        .await
        .unwrap();

    // The other scope can neither fetch nor find the record
    assert!(matches!(
        h.engine.get(&scope_b, &saved.id).await,
        Err(MemoriaError::NotFound(_))
    ));
    let results = h
        .engine
        .search(&scope_b, "secret architecture detail", 5, &SearchFilter::default())
        .await
        .unwrap();
    assert!(results.results.is_empty());
}

// ============================================================================
// PROJECT STATE & REPORTS
// ============================================================================

async fn seed_milestones(h: &Harness, scope: &Scope, start: usize, count: usize) {
    let kinds = [
        MilestoneType::ArchitectureDecision,
        MilestoneType::ProblemIdentified,
        MilestoneType::SolutionImplemented,
        MilestoneType::StatusChange,
    ];
    for i in start..start + count {
        h.engine
            .save_milestone(
                scope,
                MilestoneRequest {
                    milestone_type: kinds[i % kinds.len()],
                    content: format!("Milestone event number {} for the rollout", i),
                    impact_level: 8,
                    tags: vec![],
                },
            )
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::hours(1));
    }
}

#[tokio::test]
async fn milestone_carries_typed_payload() {
    let h = harness().await;
    let scope = project_scope();

    let record = h
        .engine
        .save_milestone(
            &scope,
            MilestoneRequest {
                milestone_type: MilestoneType::ArchitectureDecision,
                content: "Adopted event sourcing for the ledger".to_string(),
                impact_level: 9,
                tags: vec!["ledger".to_string()],
            },
        )
        .await
        .unwrap();

    assert_eq!(record.category, Category::Milestone);
    assert_eq!(record.confidence, 9);
    assert_eq!(
        record.milestone(),
        Some((MilestoneType::ArchitectureDecision, 9))
    );
    assert!(record.expires_at.is_none());
    assert!(record.tags.contains(&"milestone".to_string()));

    let bad_impact = h
        .engine
        .save_milestone(
            &scope,
            MilestoneRequest {
                milestone_type: MilestoneType::StatusChange,
                content: "x".to_string(),
                impact_level: 0,
                tags: vec![],
            },
        )
        .await;
    assert!(matches!(bad_impact, Err(MemoriaError::InvalidInput(_))));
}

#[tokio::test]
async fn project_state_derives_phase() {
    let h = harness().await;
    let scope = project_scope();

    let state = h.engine.get_project_state(&scope).await.unwrap();
    assert_eq!(state.phase, ProjectPhase::Planning);

    seed_milestones(&h, &scope, 0, 2).await;
    let state = h.engine.get_project_state(&scope).await.unwrap();
    assert_eq!(state.phase, ProjectPhase::InProgress);
    assert_eq!(state.recent_milestones.len(), 2);

    seed_milestones(&h, &scope, 2, 4).await;
    let state = h.engine.get_project_state(&scope).await.unwrap();
    assert_eq!(state.phase, ProjectPhase::Mature);
    // The rollup carries only the most recent five
    assert_eq!(state.recent_milestones.len(), 5);

    // Newest first
    let timestamps: Vec<_> = state
        .recent_milestones
        .iter()
        .map(|m| m.created_at)
        .collect();
    let mut sorted = timestamps.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(timestamps, sorted);
}

#[tokio::test]
async fn project_state_tracks_latest_status() {
    let h = harness().await;
    let scope = project_scope();

    h.engine
        .save(
            &scope,
            save_request("Rollout is in canary phase", Category::Status, 6, "ops"),
        )
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::hours(2));
    h.engine
        .save(
            &scope,
            save_request("Rollout completed to all regions", Category::Status, 6, "ops"),
        )
        .await
        .unwrap();

    let state = h.engine.get_project_state(&scope).await.unwrap();
    let latest = state.latest_status.unwrap();
    assert_eq!(latest.content, "Rollout completed to all regions");
    assert!(state.by_category.contains_key("status"));
}

#[tokio::test]
async fn evolution_timeline_keeps_supersession_edges() {
    let h = harness().await;
    let scope = project_scope();

    let first = h
        .engine
        .save(
            &scope,
            save_request("The service uses PostgreSQL", Category::Architecture, 9, "review"),
        )
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::hours(1));
    let second = h
        .engine
        .save(
            &scope,
            save_request("The service uses MongoDB", Category::Architecture, 8, "issue"),
        )
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::hours(1));
    let resolved = h
        .engine
        .resolve_conflict(
            &scope,
            &[first.id.clone(), second.id.clone()],
            "The service uses PostgreSQL as primary and MongoDB for logs.",
            "arch review",
        )
        .await
        .unwrap();

    let timeline = h.engine.track_evolution(&scope, None).await.unwrap();
    assert_eq!(timeline.events.len(), 3);
    assert_eq!(timeline.summary.deprecated_entries, 2);
    assert_eq!(timeline.summary.active_entries, 1);

    // Oldest first, with supersession edges pointing at the successor
    assert_eq!(timeline.events[0].id, first.id);
    assert_eq!(
        timeline.events[0].superseded_by.as_ref(),
        Some(&resolved.id)
    );
    assert_eq!(
        timeline.events[1].superseded_by.as_ref(),
        Some(&resolved.id)
    );
    assert!(timeline.events[2].superseded_by.is_none());

    // A limit keeps the newest part of the history
    let limited = h.engine.track_evolution(&scope, Some(1)).await.unwrap();
    assert_eq!(limited.events.len(), 1);
    assert_eq!(limited.events[0].id, resolved.id);
}

#[tokio::test]
async fn quality_audit_reports_and_requires_operator_cross_scope() {
    let h = harness().await;
    let scope = project_scope();

    h.engine
        .save(
            &scope,
            save_request("The service uses PostgreSQL", Category::Architecture, 9, "review"),
        )
        .await
        .unwrap();
    h.engine
        .save(
            &scope,
            save_request("The service uses MongoDB", Category::Architecture, 8, "issue"),
        )
        .await
        .unwrap();
    h.engine
        .save(
            &scope,
            SaveRequest {
                content: "Maybe the queue is the bottleneck".to_string(),
                category: Category::Problem,
                confidence: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = h.engine.audit_quality(Some(&scope), None).await.unwrap();
    assert_eq!(report.total_memories, 3);
    assert_eq!(report.conflicted_count, 2);
    assert_eq!(report.low_confidence_count, 1);
    assert!(report.health_score < 100);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.action.contains("resolve_conflict")));
    assert!(report.metadata_coverage < f32::EPSILON);

    let denied = h.engine.audit_quality(None, None).await;
    assert!(matches!(denied, Err(MemoriaError::InvalidInput(_))));

    let cross = h
        .engine
        .audit_quality(None, Some("ops-oncall"))
        .await
        .unwrap();
    assert_eq!(cross.audit_scope, "all scopes");
    assert_eq!(cross.total_memories, 3);
}

#[tokio::test]
async fn validate_project_needs_project_scope() {
    let h = harness().await;

    let no_project = h
        .engine
        .validate_project(&Scope::new("t1", "u1"))
        .await;
    assert!(matches!(no_project, Err(MemoriaError::InvalidInput(_))));

    let scope = project_scope();
    h.engine
        .save(
            &scope,
            save_request("The ingest worker is healthy", Category::Status, 8, "ops"),
        )
        .await
        .unwrap();

    let report = h.engine.validate_project(&scope).await.unwrap();
    assert_eq!(report.project_id, "p1");
    assert_eq!(report.total_memories, 1);
    assert_eq!(report.confidence_distribution.high, 1);
}

#[tokio::test]
async fn entity_relationships_profile() {
    let h = harness().await;
    let scope = project_scope();

    h.engine
        .save(
            &scope,
            save_request("User Alice leads team Gamma.", Category::Generic, 7, "chat"),
        )
        .await
        .unwrap();
    h.engine
        .save(
            &scope,
            save_request("User Alice mentors developer Bob.", Category::Generic, 7, "chat"),
        )
        .await
        .unwrap();

    let profile = h
        .engine
        .get_entity_relationships(&scope, "Alice")
        .await
        .unwrap();
    assert_eq!(profile.direct_mentions, 2);
    assert!(profile.connection_strength > 0.0);
    assert!(profile
        .related_entities
        .iter()
        .any(|(name, _)| name == "gamma"));
    assert!(profile.relationship_types.contains_key("leads"));

    h.graph.set_available(false);
    let down = h.engine.get_entity_relationships(&scope, "Alice").await;
    assert!(matches!(down, Err(MemoriaError::GraphStoreUnavailable(_))));
}

#[tokio::test]
async fn graph_status_reflects_outages() {
    let h = harness().await;

    let status = h.engine.graph_status().await;
    assert!(status.vector_available);
    assert!(status.graph_available);
    assert_eq!(status.search_method(), "graph+vector");

    h.graph.set_available(false);
    let status = h.engine.graph_status().await;
    assert!(!status.graph_available);
    assert_eq!(status.search_method(), "vector_only");
}
