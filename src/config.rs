//! Engine configuration
//!
//! Every scoring weight, threshold, and interval the engine uses is a knob
//! here. Defaults match production behavior; tests override freely.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the process is deployed, which decides fallback behavior when the
/// cache, pub-sub, or lock substrate errors at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// One process owns all state; local in-process fallbacks are safe
    #[default]
    SingleNode,
    /// Multiple processes share the substrate; failures must surface as
    /// retriable errors instead of silently going local
    Clustered,
}

/// Weights of the combined retrieval score
///
/// `score = alpha * vector + beta * graph + gamma * confidence/10 + delta * freshness`
/// with `freshness = exp(-age_days / freshness_tau_days)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RankWeights {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
    pub delta: f32,
    pub freshness_tau_days: f32,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            alpha: 0.55,
            beta: 0.25,
            gamma: 0.15,
            delta: 0.05,
            freshness_tau_days: 30.0,
        }
    }
}

/// Conflict detection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Vector similarity floor for a candidate to be considered at all
    pub similarity_threshold: f32,
    /// Negation markers, one list per supported language family
    pub negation_tokens: Vec<String>,
    /// Tag pairs that cannot both describe the same fact
    pub exclusive_tag_pairs: Vec<(String, String)>,
    /// How many near neighbors to test per write
    pub candidate_limit: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            negation_tokens: default_negation_tokens(),
            exclusive_tag_pairs: Vec::new(),
            candidate_limit: 20,
        }
    }
}

fn default_negation_tokens() -> Vec<String> {
    [
        // English
        "not", "no", "never", "without", "don't", "doesn't", "isn't", "won't", "cannot",
        // Russian
        "не", "нет", "никогда", "нельзя",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Weights of the audit health score's issue ratio
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityWeights {
    pub expired: f32,
    pub conflicted: f32,
    pub low_confidence: f32,
    /// Records below this confidence count as low-confidence issues
    pub low_confidence_floor: u8,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            expired: 1.0,
            conflicted: 1.0,
            low_confidence: 1.0,
            low_confidence_floor: 5,
        }
    }
}

/// Retrieval pipeline defaults
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchConfig {
    /// `get_context` result count when the caller does not pass one
    pub context_k: usize,
    /// `get_context` confidence floor when the caller does not pass one
    pub context_min_confidence: u8,
    /// Vector candidates fetched per requested result
    pub vector_fan_out: usize,
    /// Graph candidates cap per requested result
    pub graph_fan_out: usize,
    /// Graph traversal depth for entity neighborhoods
    pub max_hops: usize,
    /// Graph score assigned to neighborhood-only hits (direct graph search
    /// hits keep their own proximity score)
    pub neighborhood_score: f32,
    /// Result cache TTL in seconds
    pub cache_ttl_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            context_k: 5,
            context_min_confidence: 7,
            vector_fan_out: 2,
            graph_fan_out: 2,
            max_hops: 2,
            neighborhood_score: 0.4,
            cache_ttl_secs: 300,
        }
    }
}

/// Compensation queue tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompensationConfig {
    pub base_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// Worker tasks draining the queue
    pub workers: usize,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(60),
            max_attempts: 5,
            workers: 2,
        }
    }
}

impl CompensationConfig {
    /// Backoff delay before the given (zero-based) retry attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.min(16));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub deployment: DeploymentMode,
    pub rank: RankWeights,
    pub conflict: ConflictConfig,
    pub quality: QualityWeights,
    pub search: SearchConfig,
    pub compensation: CompensationConfig,
    /// Distributed lock TTL; also the write budget ceiling
    pub lock_ttl: Duration,
    /// Delay between lock acquisition retries
    pub lock_retry_interval: Duration,
    /// Total time spent retrying a contended lock before giving up
    pub lock_acquire_budget: Duration,
    /// Per-port call budget; exceeding it maps to a retriable timeout
    pub port_budget: Duration,
    /// Expiry sweeper period for the background worker
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deployment: DeploymentMode::default(),
            rank: RankWeights::default(),
            conflict: ConflictConfig::default(),
            quality: QualityWeights::default(),
            search: SearchConfig::default(),
            compensation: CompensationConfig::default(),
            lock_ttl: Duration::from_secs(30),
            lock_retry_interval: Duration::from_millis(25),
            lock_acquire_budget: Duration::from_secs(5),
            port_budget: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
