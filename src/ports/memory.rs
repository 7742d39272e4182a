//! In-memory reference adapters for the embedder, extractor, and both stores
//!
//! These implement the full port contracts without any external service, for
//! single-node deployments and the test suite. The embedder is a
//! deterministic token-hashing model (a TF-IDF-style fallback, not a
//! semantic one) and the extractor is rule-based, so both are cheap and
//! reproducible.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::{MemoriaError, Result};
use crate::fingerprint::scope_hash;
use crate::types::{MemoryId, MemoryRecord, Page, RecordStatus, RelationTriple, Scope, SearchFilter};

use super::{
    Embedder, Embedding, EntityRelationSummary, Extraction, Extractor, GraphStore, VectorStore,
};

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Deterministic bag-of-tokens embedder
///
/// Tokens are hashed into a fixed number of buckets and the vector is
/// L2-normalized, so cosine similarity reflects lexical overlap. Good enough
/// for tests and offline use; swap in a real provider for semantic quality.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimensions: 128 }
    }
}

fn token_bucket(token: &str, dimensions: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimensions
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[token_bucket(token, self.dimensions)] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(Embedding {
            vector,
            dimensions: self.dimensions,
        })
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Words that start sentences without naming anything
static SENTENCE_STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "this", "that", "these", "those", "it", "its", "we", "i", "our", "use",
        "when", "if", "then", "and", "or", "but", "for", "with", "from", "into", "после", "это",
    ]
    .into_iter()
    .collect()
});

/// Rule-based entity and relation extractor
///
/// Capitalized tokens become entities; a lowercase token bridging two
/// entities becomes a relation. No model behind it, so results are exact
/// and repeatable.
pub struct RuleExtractor {
    max_entities: usize,
}

impl RuleExtractor {
    pub fn new(max_entities: usize) -> Self {
        Self { max_entities }
    }
}

impl Default for RuleExtractor {
    fn default() -> Self {
        Self { max_entities: 16 }
    }
}

#[async_trait]
impl Extractor for RuleExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction> {
        // (token, is_entity) stream preserving order
        let tokens: Vec<(String, bool)> = text
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '"'))
            .filter(|t| !t.is_empty())
            .map(|raw| {
                let cleaned: String = raw
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_string();
                let is_entity = cleaned.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
                    && cleaned.chars().count() >= 2
                    && !SENTENCE_STOPWORDS.contains(cleaned.to_lowercase().as_str());
                (cleaned, is_entity)
            })
            .filter(|(t, _)| !t.is_empty())
            .collect();

        let mut entities: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for (token, is_entity) in &tokens {
            if *is_entity && seen.insert(token.to_lowercase()) {
                entities.push(token.clone());
                if entities.len() >= self.max_entities {
                    break;
                }
            }
        }

        // A lowercase token between two entity mentions reads as a relation:
        // "Alice leads Gamma" -> (alice, leads, gamma)
        let mut relations = Vec::new();
        let mut last_entity: Option<(usize, &str)> = None;
        for (idx, (token, is_entity)) in tokens.iter().enumerate() {
            if *is_entity {
                if let Some((prev_idx, prev)) = last_entity {
                    if idx > prev_idx + 1 {
                        if let Some((bridge, _)) = tokens[prev_idx + 1..idx]
                            .iter()
                            .find(|pair| !pair.1 && pair.0.chars().all(|c| c.is_alphabetic()))
                        {
                            relations.push(RelationTriple::new(
                                prev.to_lowercase(),
                                bridge.to_lowercase(),
                                token.to_lowercase(),
                            ));
                        }
                    }
                }
                last_entity = Some((idx, token.as_str()));
            }
        }

        Ok(Extraction {
            entities,
            relations,
        })
    }
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

struct StoredEntry {
    vector: Vec<f32>,
    record: MemoryRecord,
}

/// In-memory vector store holding the record payload next to its vector
///
/// `set_available(false)` makes every call fail, which is how the test suite
/// simulates backend outages.
pub struct MemoryVectorStore {
    scopes: DashMap<String, BTreeMap<MemoryId, StoredEntry>>,
    available: AtomicBool,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoriaError::VectorStoreUnavailable(
                "simulated outage".to_string(),
            ))
        }
    }

    pub fn record_count(&self, scope: &Scope) -> usize {
        self.scopes
            .get(&scope_hash(scope))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Store-side filter: everything except expiry, which needs the engine clock
fn store_matches(record: &MemoryRecord, filter: &SearchFilter) -> bool {
    if let Some(status) = filter.status {
        if record.status != status {
            return false;
        }
    } else {
        match record.status {
            RecordStatus::Deprecated if !filter.include_deprecated => return false,
            RecordStatus::Expired if !filter.include_expired => return false,
            RecordStatus::Conflicted if !filter.include_conflicted => return false,
            _ => {}
        }
    }
    if let Some(min) = filter.min_confidence {
        if record.confidence < min {
            return false;
        }
    }
    if let Some(category) = filter.category {
        if record.category != category {
            return false;
        }
    }
    if let Some(ref tag) = filter.tag {
        if !record.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    true
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(
        &self,
        scope: &Scope,
        id: &MemoryId,
        vector: &[f32],
        record: &MemoryRecord,
    ) -> Result<String> {
        self.check_available()?;
        let mut entries = self.scopes.entry(scope_hash(scope)).or_default();
        entries.insert(
            id.clone(),
            StoredEntry {
                vector: vector.to_vec(),
                record: record.clone(),
            },
        );
        Ok(format!("vec:{}:{}", scope_hash(scope), id))
    }

    async fn delete(&self, scope: &Scope, id: &MemoryId) -> Result<()> {
        self.check_available()?;
        if let Some(mut entries) = self.scopes.get_mut(&scope_hash(scope)) {
            entries.remove(id);
        }
        Ok(())
    }

    async fn search(
        &self,
        scope: &Scope,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<(MemoryId, f32)>> {
        self.check_available()?;
        let mut scored: Vec<(MemoryId, f32)> = Vec::new();
        if let Some(entries) = self.scopes.get(&scope_hash(scope)) {
            for (id, entry) in entries.iter() {
                if !store_matches(&entry.record, filter) {
                    continue;
                }
                let similarity = cosine_similarity(vector, &entry.vector).clamp(0.0, 1.0);
                scored.push((id.clone(), similarity));
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn fetch(&self, scope: &Scope, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        self.check_available()?;
        Ok(self
            .scopes
            .get(&scope_hash(scope))
            .and_then(|entries| entries.get(id).map(|e| e.record.clone())))
    }

    async fn list(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<MemoryRecord>> {
        self.check_available()?;
        let mut items = Vec::new();
        if let Some(entries) = self.scopes.get(&scope_hash(scope)) {
            let iter: Box<dyn Iterator<Item = (&MemoryId, &StoredEntry)> + '_> = match cursor {
                Some(cursor) => Box::new(
                    entries
                        .range::<MemoryId, _>((
                            std::ops::Bound::Excluded(cursor.to_string()),
                            std::ops::Bound::Unbounded,
                        ))
                        .map(|(k, v)| (k, v)),
                ),
                None => Box::new(entries.iter()),
            };
            for (_, entry) in iter.take(limit) {
                items.push(entry.record.clone());
            }
        }
        let next_cursor = if items.len() == limit {
            items.last().map(|r| r.id.clone())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn update_metadata(&self, scope: &Scope, record: &MemoryRecord) -> Result<()> {
        self.check_available()?;
        let mut entries = self
            .scopes
            .get_mut(&scope_hash(scope))
            .ok_or_else(|| MemoriaError::NotFound(record.id.clone()))?;
        let entry = entries
            .get_mut(&record.id)
            .ok_or_else(|| MemoriaError::NotFound(record.id.clone()))?;
        entry.record = record.clone();
        Ok(())
    }

    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Graph store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    src: String,
    relation: String,
    dst: String,
    record_id: MemoryId,
}

#[derive(Default)]
struct ScopeGraph {
    /// entity name (lowercased) -> records mentioning it
    mentions: BTreeMap<String, BTreeSet<MemoryId>>,
    edges: Vec<Edge>,
}

/// In-memory knowledge graph with per-scope adjacency
pub struct MemoryGraphStore {
    scopes: DashMap<String, ScopeGraph>,
    available: AtomicBool,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoriaError::GraphStoreUnavailable(
                "simulated outage".to_string(),
            ))
        }
    }

    /// Records attributed to an entity (test hook)
    pub fn mention_count(&self, scope: &Scope, entity: &str) -> usize {
        self.scopes
            .get(&scope_hash(scope))
            .and_then(|g| g.mentions.get(&entity.to_lowercase()).map(|m| m.len()))
            .unwrap_or(0)
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn merge_entity(&self, scope: &Scope, name: &str, record_id: &MemoryId) -> Result<()> {
        self.check_available()?;
        let mut graph = self.scopes.entry(scope_hash(scope)).or_default();
        graph
            .mentions
            .entry(name.to_lowercase())
            .or_default()
            .insert(record_id.clone());
        Ok(())
    }

    async fn merge_relation(
        &self,
        scope: &Scope,
        src: &str,
        relation: &str,
        dst: &str,
        record_id: &MemoryId,
    ) -> Result<()> {
        self.check_available()?;
        let mut graph = self.scopes.entry(scope_hash(scope)).or_default();
        let edge = Edge {
            src: src.to_lowercase(),
            relation: relation.to_lowercase(),
            dst: dst.to_lowercase(),
            record_id: record_id.clone(),
        };
        graph
            .mentions
            .entry(edge.src.clone())
            .or_default()
            .insert(record_id.clone());
        graph
            .mentions
            .entry(edge.dst.clone())
            .or_default()
            .insert(record_id.clone());
        if !graph.edges.contains(&edge) {
            graph.edges.push(edge);
        }
        Ok(())
    }

    async fn detach_record(&self, scope: &Scope, id: &MemoryId) -> Result<()> {
        self.check_available()?;
        if let Some(mut graph) = self.scopes.get_mut(&scope_hash(scope)) {
            for records in graph.mentions.values_mut() {
                records.remove(id);
            }
            graph.mentions.retain(|_, records| !records.is_empty());
            graph.edges.retain(|e| &e.record_id != id);
        }
        Ok(())
    }

    async fn search(
        &self,
        scope: &Scope,
        query_terms: &[String],
        k: usize,
        _filter: &SearchFilter,
    ) -> Result<Vec<(MemoryId, f32)>> {
        self.check_available()?;
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: HashMap<MemoryId, usize> = HashMap::new();
        if let Some(graph) = self.scopes.get(&scope_hash(scope)) {
            for term in query_terms {
                let term = term.to_lowercase();
                for (entity, records) in graph.mentions.iter() {
                    if entity == &term || entity.contains(term.as_str()) {
                        for id in records {
                            *hits.entry(id.clone()).or_insert(0) += 1;
                        }
                    }
                }
            }
        }
        let total = query_terms.len() as f32;
        let mut scored: Vec<(MemoryId, f32)> = hits
            .into_iter()
            .map(|(id, matched)| (id, (matched as f32 / total).clamp(0.0, 1.0)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn neighborhood(
        &self,
        scope: &Scope,
        entity: &str,
        max_hops: usize,
    ) -> Result<Vec<MemoryId>> {
        self.check_available()?;
        let mut result: Vec<MemoryId> = Vec::new();
        let mut seen_records: HashSet<MemoryId> = HashSet::new();
        let Some(graph) = self.scopes.get(&scope_hash(scope)) else {
            return Ok(result);
        };

        let start = entity.to_lowercase();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        visited.insert(start.clone());
        frontier.push_back((start, 0));

        while let Some((current, hops)) = frontier.pop_front() {
            if let Some(records) = graph.mentions.get(&current) {
                for id in records {
                    if seen_records.insert(id.clone()) {
                        result.push(id.clone());
                    }
                }
            }
            if hops >= max_hops {
                continue;
            }
            for edge in &graph.edges {
                let neighbor = if edge.src == current {
                    Some(&edge.dst)
                } else if edge.dst == current {
                    Some(&edge.src)
                } else {
                    None
                };
                if let Some(neighbor) = neighbor {
                    if visited.insert(neighbor.clone()) {
                        frontier.push_back((neighbor.clone(), hops + 1));
                    }
                }
            }
        }
        Ok(result)
    }

    async fn relation_summary(
        &self,
        scope: &Scope,
        entity: &str,
    ) -> Result<EntityRelationSummary> {
        self.check_available()?;
        let mut summary = EntityRelationSummary::default();
        let Some(graph) = self.scopes.get(&scope_hash(scope)) else {
            return Ok(summary);
        };
        let entity = entity.to_lowercase();

        if let Some(records) = graph.mentions.get(&entity) {
            summary.mentions = records.iter().cloned().collect();
        }

        let mut related: BTreeMap<String, usize> = BTreeMap::new();
        for edge in &graph.edges {
            let neighbor = if edge.src == entity {
                Some(&edge.dst)
            } else if edge.dst == entity {
                Some(&edge.src)
            } else {
                None
            };
            if let Some(neighbor) = neighbor {
                *related.entry(neighbor.clone()).or_insert(0) += 1;
                *summary
                    .relation_types
                    .entry(edge.relation.clone())
                    .or_insert(0) += 1;
            }
        }
        let mut related: Vec<(String, usize)> = related.into_iter().collect();
        related.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        summary.related = related;
        Ok(summary)
    }

    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, CategoryData};
    use chrono::Utc;

    fn scope() -> Scope {
        Scope::new("t1", "u1").with_project("p1")
    }

    fn record(id: &str, content: &str) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: id.to_string(),
            scope: scope(),
            content: content.to_string(),
            embedding_ref: None,
            entities: vec![],
            relations: vec![],
            category: Category::Generic,
            data: CategoryData::General,
            confidence: 5,
            source: "test".to_string(),
            tags: vec![],
            created_at: now,
            updated_at: now,
            expires_at: None,
            version: 1,
            status: RecordStatus::Active,
            superseded_by: None,
            conflict_with: vec![],
            extra_metadata: Default::default(),
            degraded: false,
            extraction_failed: false,
        }
    }

    #[tokio::test]
    async fn embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("the service uses postgresql").await.unwrap();
        let b = embedder.embed("the service uses postgresql").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("the service uses postgresql").await.unwrap();
        let b = embedder.embed("the service uses mongodb").await.unwrap();
        let c = embedder.embed("alice enjoys mountain hiking").await.unwrap();
        let sim_ab = cosine_similarity(&a.vector, &b.vector);
        let sim_ac = cosine_similarity(&a.vector, &c.vector);
        assert!(sim_ab > sim_ac);
        assert!(sim_ab > 0.5);
    }

    #[tokio::test]
    async fn extractor_finds_entities_and_relations() {
        let extractor = RuleExtractor::default();
        let extraction = extractor
            .extract("User Alice leads team Gamma.")
            .await
            .unwrap();
        assert!(extraction.entities.iter().any(|e| e == "Alice"));
        assert!(extraction.entities.iter().any(|e| e == "Gamma"));
        assert!(extraction
            .relations
            .iter()
            .any(|r| r.src == "alice" && r.relation == "leads" && r.dst == "gamma"));
    }

    #[tokio::test]
    async fn extractor_skips_sentence_stopwords() {
        let extractor = RuleExtractor::default();
        let extraction = extractor
            .extract("The service uses PostgreSQL")
            .await
            .unwrap();
        assert_eq!(extraction.entities, vec!["PostgreSQL".to_string()]);
    }

    #[tokio::test]
    async fn vector_store_roundtrip_and_pagination() {
        let store = MemoryVectorStore::new();
        let s = scope();
        for i in 0..5 {
            let r = record(&format!("{:032x}", i), &format!("content {}", i));
            store
                .upsert(&s, &r.id.clone(), &[1.0, 0.0], &r)
                .await
                .unwrap();
        }
        assert_eq!(store.record_count(&s), 5);

        let page1 = store.list(&s, None, 3).await.unwrap();
        assert_eq!(page1.items.len(), 3);
        let cursor = page1.next_cursor.clone().unwrap();
        let page2 = store.list(&s, Some(&cursor), 3).await.unwrap();
        assert_eq!(page2.items.len(), 2);
        assert!(page2.next_cursor.is_none());
    }

    #[tokio::test]
    async fn vector_store_outage() {
        let store = MemoryVectorStore::new();
        store.set_available(false);
        let r = record(&"a".repeat(32), "x");
        let err = store.upsert(&scope(), &r.id.clone(), &[1.0], &r).await;
        assert!(matches!(err, Err(MemoriaError::VectorStoreUnavailable(_))));
        assert!(!store.available().await);
    }

    #[tokio::test]
    async fn graph_neighborhood_respects_hops() {
        let store = MemoryGraphStore::new();
        let s = scope();
        let r1 = "1".repeat(32);
        let r2 = "2".repeat(32);
        let r3 = "3".repeat(32);
        // alice -> gamma -> redis, each asserted by a different record
        store.merge_relation(&s, "alice", "leads", "gamma", &r1).await.unwrap();
        store.merge_relation(&s, "gamma", "runs", "redis", &r2).await.unwrap();
        store.merge_entity(&s, "redis", &r3).await.unwrap();

        let one_hop = store.neighborhood(&s, "alice", 1).await.unwrap();
        assert!(one_hop.contains(&r1));
        assert!(one_hop.contains(&r2)); // gamma is 1 hop away and r2 mentions it

        let zero_hop = store.neighborhood(&s, "redis", 0).await.unwrap();
        assert!(zero_hop.contains(&r2) && zero_hop.contains(&r3));
    }

    #[tokio::test]
    async fn graph_detach_removes_attribution() {
        let store = MemoryGraphStore::new();
        let s = scope();
        let r1 = "1".repeat(32);
        store.merge_relation(&s, "alice", "leads", "gamma", &r1).await.unwrap();
        assert_eq!(store.mention_count(&s, "alice"), 1);

        store.detach_record(&s, &r1).await.unwrap();
        assert_eq!(store.mention_count(&s, "alice"), 0);
        let hits = store
            .search(&s, &["alice".to_string()], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn relation_summary_counts_edges() {
        let store = MemoryGraphStore::new();
        let s = scope();
        let r1 = "1".repeat(32);
        let r2 = "2".repeat(32);
        store.merge_relation(&s, "alice", "leads", "gamma", &r1).await.unwrap();
        store.merge_relation(&s, "alice", "mentors", "bob", &r2).await.unwrap();

        let summary = store.relation_summary(&s, "alice").await.unwrap();
        assert_eq!(summary.mentions.len(), 2);
        assert_eq!(summary.related.len(), 2);
        assert_eq!(summary.relation_types.get("leads"), Some(&1));
        assert_eq!(summary.relation_types.get("mentors"), Some(&1));
    }
}
