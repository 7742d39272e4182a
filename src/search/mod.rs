//! Hybrid retrieval pipeline
//!
//! Reads fan out to the vector index and the knowledge graph in parallel,
//! merge and deduplicate the candidates, apply the quality filter, rank by
//! the combined score, and cache the result under a scope-prefixed key. One
//! path failing degrades the read instead of failing it; both failing is an
//! error.

pub mod rank;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{MemoriaError, Result};
use crate::fingerprint::{context_cache_key, search_cache_key};
use crate::types::{
    EntityRelationships, MatchInfo, MemoryId, MemoryRecord, ScoredMemory, Scope, SearchFilter,
    SearchResults,
};

use crate::engine::MemoryEngine;

impl MemoryEngine {
    /// Ranked hybrid search over one scope
    pub async fn search(
        &self,
        scope: &Scope,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<SearchResults> {
        scope.validate()?;
        let k = k.clamp(1, 100);
        self.stats.search();

        let cache_key = search_cache_key(scope, query, k, filter);
        if let Some(cached) = self.cached_results(&cache_key).await {
            return Ok(cached);
        }

        let results = self.hybrid_query(scope, query, k, filter).await?;
        self.store_results(&cache_key, &results).await;
        Ok(results)
    }

    /// Quality-filtered retrieval preset: active records only, confidence
    /// floor (default 7), k default 5
    pub async fn get_context(
        &self,
        scope: &Scope,
        query: &str,
        min_confidence: Option<u8>,
        k: Option<usize>,
    ) -> Result<SearchResults> {
        scope.validate()?;
        let min_confidence = min_confidence.unwrap_or(self.config.search.context_min_confidence);
        let k = k.unwrap_or(self.config.search.context_k).clamp(1, 100);
        self.stats.search();

        let cache_key = context_cache_key(scope, query, k, min_confidence);
        if let Some(cached) = self.cached_results(&cache_key).await {
            return Ok(cached);
        }

        let filter = SearchFilter::context(min_confidence);
        let results = self.hybrid_query(scope, query, k, &filter).await?;
        self.store_results(&cache_key, &results).await;
        Ok(results)
    }

    async fn cached_results(&self, key: &str) -> Option<SearchResults> {
        match self.cache_get(key).await {
            Ok(Some(json)) => match serde_json::from_str::<SearchResults>(&json) {
                Ok(results) => {
                    self.stats.cache_hit();
                    Some(results)
                }
                Err(e) => {
                    warn!(error = %e, "cached search result unreadable, discarding");
                    None
                }
            },
            Ok(None) => {
                self.stats.cache_miss();
                None
            }
            Err(e) => {
                warn!(error = %e, "cache read failed");
                self.stats.cache_miss();
                None
            }
        }
    }

    async fn store_results(&self, key: &str, results: &SearchResults) {
        match serde_json::to_string(results) {
            Ok(json) => {
                if let Err(e) = self.cache_set(key, &json).await {
                    warn!(error = %e, "search result not cached");
                }
            }
            Err(e) => warn!(error = %e, "search result not serializable for cache"),
        }
    }

    async fn hybrid_query(
        &self,
        scope: &Scope,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<SearchResults> {
        let vector_k = k * self.config.search.vector_fan_out.max(1);
        let graph_k = k * self.config.search.graph_fan_out.max(1);

        let vector_path = self.with_budget("vector.search", async {
            let embedding = self.ports.embedder.embed(query).await?;
            self.ports
                .vector
                .search(scope, &embedding.vector, vector_k, filter)
                .await
        });
        let graph_path = self.with_budget("graph.search", async {
            let terms = self.query_terms(query).await;
            if terms.is_empty() {
                return Ok(Vec::new());
            }
            let mut hits = self
                .ports
                .graph
                .search(scope, &terms, graph_k, filter)
                .await?;
            // Entity neighborhoods widen recall beyond direct term matches
            let mut seen: HashMap<MemoryId, ()> =
                hits.iter().map(|(id, _)| (id.clone(), ())).collect();
            for term in &terms {
                if hits.len() >= graph_k {
                    break;
                }
                let neighborhood = self
                    .ports
                    .graph
                    .neighborhood(scope, term, self.config.search.max_hops)
                    .await?;
                for id in neighborhood {
                    if hits.len() >= graph_k {
                        break;
                    }
                    if seen.insert(id.clone(), ()).is_none() {
                        hits.push((id, self.config.search.neighborhood_score));
                    }
                }
            }
            Ok(hits)
        });

        let (vector_result, graph_result) = tokio::join!(vector_path, graph_path);

        let degraded = vector_result.is_err() || graph_result.is_err();
        let (vector_hits, graph_hits) = match (vector_result, graph_result) {
            (Ok(v), Ok(g)) => (v, g),
            (Ok(v), Err(e)) => {
                warn!(error = %e, "graph path unavailable, vector-only read");
                (v, Vec::new())
            }
            (Err(e), Ok(g)) => {
                warn!(error = %e, "vector path unavailable, graph-only read");
                (Vec::new(), g)
            }
            (Err(vector_err), Err(graph_err)) => {
                warn!(vector = %vector_err, graph = %graph_err, "both retrieval paths failed");
                return Err(vector_err);
            }
        };

        // Merge candidates by id, keeping the best score per path
        let mut candidates: HashMap<MemoryId, (Option<f32>, Option<f32>)> = HashMap::new();
        for (id, score) in vector_hits {
            let entry = candidates.entry(id).or_insert((None, None));
            entry.0 = Some(entry.0.map_or(score, |s: f32| s.max(score)));
        }
        for (id, score) in graph_hits {
            let entry = candidates.entry(id).or_insert((None, None));
            entry.1 = Some(entry.1.map_or(score, |s: f32| s.max(score)));
        }

        let now = self.now();
        let mut results = Vec::with_capacity(candidates.len());
        for (id, (vector_score, graph_score)) in candidates {
            let Some(record) = self.rehydrate(scope, &id).await else {
                continue;
            };
            if !filter.admits(&record, now) {
                continue;
            }
            let score = rank::combined_score(
                &self.config.rank,
                vector_score,
                graph_score,
                record.confidence,
                record.created_at,
                now,
            );
            results.push(ScoredMemory {
                memory: record,
                score,
                match_info: MatchInfo {
                    vector_score,
                    graph_score,
                },
            });
        }

        rank::order_results(&mut results);
        results.truncate(k);
        debug!(results = results.len(), degraded, "hybrid query complete");
        Ok(SearchResults { results, degraded })
    }

    /// Query terms for the graph path: extracted entities, falling back to
    /// the query's significant tokens when the extractor has nothing
    async fn query_terms(&self, query: &str) -> Vec<String> {
        let extracted = match self.ports.extractor.extract(query).await {
            Ok(extraction) => extraction.entities,
            Err(e) => {
                warn!(error = %e, "query extraction failed, using raw tokens");
                Vec::new()
            }
        };
        if !extracted.is_empty() {
            return extracted.into_iter().map(|e| e.to_lowercase()).collect();
        }
        query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= 3)
            .map(|t| t.to_string())
            .collect()
    }

    /// Rehydrate a candidate id into a full record, falling back to the
    /// compensation queue's pending copy when the vector leg is missing
    async fn rehydrate(&self, scope: &Scope, id: &MemoryId) -> Option<MemoryRecord> {
        match self.ports.vector.fetch(scope, id).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => self.compensation.pending_record(id),
            Err(_) => self.compensation.pending_record(id),
        }
    }

    /// Relationship profile of an entity inside one scope
    pub async fn get_entity_relationships(
        &self,
        scope: &Scope,
        entity: &str,
    ) -> Result<EntityRelationships> {
        scope.validate()?;
        if entity.trim().is_empty() {
            return Err(MemoriaError::InvalidInput(
                "entity name must not be empty".to_string(),
            ));
        }
        if !self.ports.graph.available().await {
            return Err(MemoriaError::GraphStoreUnavailable(
                "entity relationships need the graph store".to_string(),
            ));
        }
        let summary = self
            .with_budget(
                "graph.relation_summary",
                self.ports.graph.relation_summary(scope, entity),
            )
            .await?;

        let total_records = self.count_scope_records(scope).await;
        let connection_strength = if total_records == 0 {
            0.0
        } else {
            (summary.mentions.len() as f32 / total_records as f32).clamp(0.0, 1.0)
        };
        Ok(EntityRelationships {
            entity: entity.to_string(),
            direct_mentions: summary.mentions.len(),
            related_entities: summary.related,
            relationship_types: summary.relation_types,
            connection_strength,
        })
    }

    async fn count_scope_records(&self, scope: &Scope) -> usize {
        let mut count = 0;
        let mut cursor: Option<String> = None;
        loop {
            match self.ports.vector.list(scope, cursor.as_deref(), 500).await {
                Ok(page) => {
                    count += page.items.len();
                    cursor = page.next_cursor;
                    if cursor.is_none() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "scope count unavailable");
                    break;
                }
            }
        }
        count
    }
}
