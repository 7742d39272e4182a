//! Combined scoring and deterministic ordering for hybrid retrieval

use chrono::{DateTime, Utc};

use crate::config::RankWeights;
use crate::types::ScoredMemory;

/// Exponential freshness decay over record age
pub fn freshness(age_days: f32, tau_days: f32) -> f32 {
    if tau_days <= 0.0 {
        return 0.0;
    }
    (-age_days.max(0.0) / tau_days).exp()
}

/// Linear combination of vector similarity, graph proximity, confidence, and
/// freshness
pub fn combined_score(
    weights: &RankWeights,
    vector_score: Option<f32>,
    graph_score: Option<f32>,
    confidence: u8,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f32 {
    let age_days = (now - created_at).num_seconds().max(0) as f32 / 86_400.0;
    weights.alpha * vector_score.unwrap_or(0.0)
        + weights.beta * graph_score.unwrap_or(0.0)
        + weights.gamma * (confidence as f32 / 10.0)
        + weights.delta * freshness(age_days, weights.freshness_tau_days)
}

/// Strictly deterministic ordering: score desc, then created_at desc, then
/// id asc
pub fn order_results(results: &mut [ScoredMemory]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
}
