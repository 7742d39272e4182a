//! Conflict detection and resolution
//!
//! Detection is advisory: a new record that contradicts near neighbors is
//! stored with `status = conflicted` and both sides are flagged, but nothing
//! is deprecated until `resolve_conflict` writes a consolidated successor.

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConflictConfig;
use crate::error::{MemoriaError, Result};
use crate::events::{ChangeEvent, Topic};
use crate::fingerprint::{fingerprint, resolve_lock_key, scope_hash};
use crate::types::{
    Category, CategoryData, MemoryId, MemoryRecord, RecordStatus, Scope, SearchFilter,
};

use super::save::WriteSpec;
use super::MemoryEngine;

/// `key: value` / `key = value` assertions inside prose
static ASSERTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)([\w][\w /\-]{0,40}?)\s*[:=]\s*([^\s,;.]+)").expect("assertion regex")
});

fn word_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(|t| t.trim_matches('\'').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// One side carries a negation marker the other lacks
pub fn has_negation_asymmetry(a: &str, b: &str, negation_tokens: &[String]) -> bool {
    let tokens_a: HashSet<String> = word_tokens(a).into_iter().collect();
    let tokens_b: HashSet<String> = word_tokens(b).into_iter().collect();
    negation_tokens
        .iter()
        .any(|n| tokens_a.contains(n) != tokens_b.contains(n))
}

/// Both sides assert a value for the same key, and the values differ
///
/// Two forms count as an assertion: an explicit `key: value` pair, and a
/// shared sentence stem with a diverging tail ("the service uses postgresql"
/// vs "the service uses mongodb" asserts different values for the stem
/// "the service uses").
pub fn has_conflicting_assertions(a: &str, b: &str) -> bool {
    // Explicit key/value pairs
    let pairs = |text: &str| -> HashMap<String, String> {
        ASSERTION_RE
            .captures_iter(text)
            .map(|c| {
                (
                    c[1].trim().to_lowercase(),
                    c[2].trim().to_lowercase(),
                )
            })
            .collect()
    };
    let pairs_a = pairs(a);
    let pairs_b = pairs(b);
    for (key, value_a) in &pairs_a {
        if let Some(value_b) = pairs_b.get(key) {
            if value_a != value_b {
                return true;
            }
        }
    }

    // Shared stem, diverging tail
    let tokens_a = word_tokens(a);
    let tokens_b = word_tokens(b);
    if tokens_a.len() < 3 || tokens_b.len() < 3 {
        return false;
    }
    let stem = tokens_a
        .iter()
        .zip(tokens_b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    if stem == 0 || stem == tokens_a.len().min(tokens_b.len()) {
        return false;
    }
    let coverage_a = stem as f32 / tokens_a.len() as f32;
    let coverage_b = stem as f32 / tokens_b.len() as f32;
    coverage_a >= 0.6 && coverage_b >= 0.6
}

/// Both records carry tags from a configured mutually-exclusive pair
pub fn has_exclusive_tags(
    tags_a: &[String],
    tags_b: &[String],
    pairs: &[(String, String)],
) -> bool {
    pairs.iter().any(|(x, y)| {
        (tags_a.contains(x) && tags_b.contains(y)) || (tags_a.contains(y) && tags_b.contains(x))
    })
}

/// The full textual test battery from the detection pipeline
pub fn contents_conflict(
    new_content: &str,
    new_tags: &[String],
    peer: &MemoryRecord,
    config: &ConflictConfig,
) -> bool {
    has_negation_asymmetry(new_content, &peer.content, &config.negation_tokens)
        || has_conflicting_assertions(new_content, &peer.content)
        || has_exclusive_tags(new_tags, &peer.tags, &config.exclusive_tag_pairs)
}

impl MemoryEngine {
    /// Find peers the new content contradicts: same scope, same category,
    /// vector similarity above the threshold, and a textual test firing.
    /// Detection errors degrade to "no conflicts" because the pass is
    /// advisory.
    pub(crate) async fn detect_conflicts(
        &self,
        scope: &Scope,
        id: &MemoryId,
        content: &str,
        category: Category,
        tags: &[String],
        vector: &[f32],
    ) -> Vec<MemoryRecord> {
        let filter = SearchFilter {
            category: Some(category),
            include_conflicted: true,
            ..Default::default()
        };
        let candidates = match self
            .with_budget(
                "vector.search",
                self.ports.vector.search(
                    scope,
                    vector,
                    self.config.conflict.candidate_limit,
                    &filter,
                ),
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "conflict detection skipped: vector search failed");
                return Vec::new();
            }
        };

        let mut peers = Vec::new();
        for (candidate_id, similarity) in candidates {
            if &candidate_id == id || similarity < self.config.conflict.similarity_threshold {
                continue;
            }
            let record = match self.ports.vector.fetch(scope, &candidate_id).await {
                Ok(Some(record)) => record,
                _ => continue,
            };
            if matches!(
                record.status,
                RecordStatus::Deprecated | RecordStatus::Expired
            ) {
                continue;
            }
            if contents_conflict(content, tags, &record, &self.config.conflict) {
                debug!(peer = %record.id, similarity, "conflict detected");
                peers.push(record);
            }
        }
        peers
    }

    /// Second detection pass: mark the older peers as conflicted too
    pub(crate) async fn flag_conflicted_peers(
        &self,
        scope: &Scope,
        new_id: &MemoryId,
        peers: &[MemoryRecord],
    ) {
        for peer in peers {
            let mut flagged = peer.clone();
            if !flagged.conflict_with.contains(new_id) {
                flagged.conflict_with.push(new_id.clone());
            }
            if flagged.status == RecordStatus::Active {
                flagged.status = RecordStatus::Conflicted;
            }
            flagged.updated_at = self.now();
            if let Err(e) = self.ports.vector.update_metadata(scope, &flagged).await {
                warn!(peer = %peer.id, error = %e, "peer conflict flag not persisted");
                continue;
            }
            let event = ChangeEvent::new(Topic::MemoryConflicted, scope_hash(scope), self.now())
                .with_id(peer.id.clone())
                .with_extra(serde_json::json!({ "conflict_with": [new_id] }));
            if let Err(e) = self.publish(event).await {
                warn!(error = %e, "peer conflict event dropped");
            }
        }
    }

    /// Replace a set of contradicting records with one consolidated
    /// successor.
    ///
    /// Every original is deprecated with `superseded_by` pointing at the new
    /// record; calling again with an already-deprecated input fails with
    /// `ConflictUnresolved`.
    pub async fn resolve_conflict(
        &self,
        scope: &Scope,
        conflicting_ids: &[MemoryId],
        correct_content: &str,
        reason: &str,
    ) -> Result<MemoryRecord> {
        scope.validate()?;
        if conflicting_ids.len() < 2 {
            return Err(MemoriaError::InvalidInput(
                "conflict resolution needs at least two record ids".to_string(),
            ));
        }
        if correct_content.trim().is_empty() {
            return Err(MemoriaError::InvalidInput(
                "consolidated content must not be empty".to_string(),
            ));
        }
        let new_id = fingerprint(scope, correct_content);
        if conflicting_ids.contains(&new_id) {
            return Err(MemoriaError::InvalidInput(
                "consolidated content is identical to a conflicting record".to_string(),
            ));
        }

        let lock_key = resolve_lock_key(scope, conflicting_ids);
        let holder = Uuid::new_v4().to_string();
        self.with_write_lock(&lock_key, &holder, || async {
            // Validate every original before touching anything
            let mut originals = Vec::with_capacity(conflicting_ids.len());
            for id in conflicting_ids {
                let record = self.get(scope, id).await?;
                if record.status == RecordStatus::Deprecated {
                    return Err(MemoriaError::ConflictUnresolved(format!(
                        "record {} is already deprecated",
                        id
                    )));
                }
                originals.push(record);
            }

            let category = originals[0].category;
            let mut extra_metadata = BTreeMap::new();
            extra_metadata.insert("resolution_reason".to_string(), reason.to_string());
            extra_metadata.insert(
                "resolved_from".to_string(),
                conflicting_ids.join(","),
            );

            let spec = WriteSpec {
                content: correct_content.to_string(),
                category,
                data: CategoryData::General,
                confidence: 10,
                source: "conflict_resolution".to_string(),
                tags: vec!["conflict_resolved".to_string()],
                expires_at: None,
                extra_metadata,
                conflict_with: conflicting_ids.to_vec(),
                detect_conflicts: false,
            };
            let (_, new_record) = self.write_record(scope, spec).await?;

            // Deprecate the originals and point them at the successor
            for original in &originals {
                let mut deprecated = original.clone();
                deprecated.status = RecordStatus::Deprecated;
                deprecated.superseded_by = Some(new_record.id.clone());
                deprecated.version += 1;
                deprecated.updated_at = self.now();
                self.assert_acyclic_supersession(scope, &deprecated).await?;
                self.ports
                    .vector
                    .update_metadata(scope, &deprecated)
                    .await?;
                self.publish(
                    ChangeEvent::new(Topic::MemoryDeprecated, scope_hash(scope), self.now())
                        .with_id(original.id.clone())
                        .with_extra(serde_json::json!({
                            "superseded_by": new_record.id,
                            "reason": reason,
                        })),
                )
                .await?;
            }

            self.invalidate_scope(scope).await?;
            Ok(new_record)
        })
        .await
    }

    /// Walk a record's supersession chain and reject cycles or self-links
    pub(crate) async fn assert_acyclic_supersession(
        &self,
        scope: &Scope,
        record: &MemoryRecord,
    ) -> Result<()> {
        let mut visited: HashSet<MemoryId> = HashSet::new();
        visited.insert(record.id.clone());
        let mut next = record.superseded_by.clone();
        while let Some(id) = next {
            if !visited.insert(id.clone()) {
                return Err(MemoriaError::Internal(format!(
                    "supersession cycle through {}",
                    id
                )));
            }
            next = match self.ports.vector.fetch(scope, &id).await? {
                Some(successor) => successor.superseded_by,
                None => None,
            };
        }
        Ok(())
    }
}
