//! Core types for Memoria

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a memory (lowercase hex of the 128-bit fingerprint)
pub type MemoryId = String;

/// Isolation scope for every memory record
///
/// All reads and writes are qualified by a scope; cross-scope access is
/// impossible by construction because every store key embeds the scope hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Tenant (organization) identifier
    pub tenant: String,
    /// User identifier
    pub user: String,
    /// Optional agent instance identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Optional conversation session identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Optional project identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl Scope {
    /// Create a tenant/user scope
    pub fn new(tenant: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            user: user.into(),
            agent: None,
            session: None,
            project: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Validate scope completeness (tenant and user are required)
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.tenant.trim().is_empty() || self.user.trim().is_empty() {
            return Err(crate::error::MemoriaError::InvalidInput(
                "scope requires non-empty tenant and user".to_string(),
            ));
        }
        Ok(())
    }
}

/// Content category of a memory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Architecture,
    Problem,
    Solution,
    Status,
    Decision,
    Milestone,
    #[default]
    Generic,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Architecture => "architecture",
            Category::Problem => "problem",
            Category::Solution => "solution",
            Category::Status => "status",
            Category::Decision => "decision",
            Category::Milestone => "milestone",
            Category::Generic => "generic",
        }
    }

    /// Confidence assigned when the caller does not provide one
    pub fn default_confidence(&self) -> u8 {
        match self {
            Category::Architecture => 8,
            Category::Decision => 8,
            Category::Solution => 7,
            Category::Problem => 6,
            Category::Status => 6,
            Category::Milestone => 9,
            Category::Generic => 5,
        }
    }

    /// Days until expiry when the caller does not provide one (None = never)
    pub fn default_ttl_days(&self) -> Option<i64> {
        match self {
            Category::Architecture => Some(180),
            Category::Decision => Some(365),
            Category::Solution => Some(120),
            Category::Problem => Some(90),
            Category::Status => Some(30),
            Category::Milestone => None,
            Category::Generic => None,
        }
    }

    pub fn all() -> &'static [Category] {
        &[
            Category::Architecture,
            Category::Problem,
            Category::Solution,
            Category::Status,
            Category::Decision,
            Category::Milestone,
            Category::Generic,
        ]
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "architecture" => Ok(Category::Architecture),
            "problem" => Ok(Category::Problem),
            "solution" => Ok(Category::Solution),
            "status" => Ok(Category::Status),
            "decision" => Ok(Category::Decision),
            "milestone" => Ok(Category::Milestone),
            "generic" => Ok(Category::Generic),
            _ => Err(format!("Unknown category: {}", s)),
        }
    }
}

/// Lifecycle status of a memory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Normal state, returned by quality-filtered reads
    #[default]
    Active,
    /// Replaced by a successor; superseded_by must be set
    Deprecated,
    /// Contradicts at least one peer; conflict_with lists them
    Conflicted,
    /// Past expires_at; hidden from quality-filtered reads, kept for history
    Expired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Deprecated => "deprecated",
            RecordStatus::Conflicted => "conflicted",
            RecordStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(RecordStatus::Active),
            "deprecated" => Ok(RecordStatus::Deprecated),
            "conflicted" => Ok(RecordStatus::Conflicted),
            "expired" => Ok(RecordStatus::Expired),
            _ => Err(format!("Unknown record status: {}", s)),
        }
    }
}

/// Kind of project milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneType {
    ArchitectureDecision,
    ProblemIdentified,
    SolutionImplemented,
    StatusChange,
}

impl MilestoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneType::ArchitectureDecision => "architecture_decision",
            MilestoneType::ProblemIdentified => "problem_identified",
            MilestoneType::SolutionImplemented => "solution_implemented",
            MilestoneType::StatusChange => "status_change",
        }
    }

    pub fn all() -> &'static [MilestoneType] {
        &[
            MilestoneType::ArchitectureDecision,
            MilestoneType::ProblemIdentified,
            MilestoneType::SolutionImplemented,
            MilestoneType::StatusChange,
        ]
    }
}

impl std::str::FromStr for MilestoneType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "architecture_decision" => Ok(MilestoneType::ArchitectureDecision),
            "problem_identified" => Ok(MilestoneType::ProblemIdentified),
            "solution_implemented" => Ok(MilestoneType::SolutionImplemented),
            "status_change" => Ok(MilestoneType::StatusChange),
            _ => Err(format!("Unknown milestone type: {}", s)),
        }
    }
}

/// Category-specific payload, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CategoryData {
    /// Milestone records carry a typed kind and an impact level (1..10)
    Milestone {
        milestone_type: MilestoneType,
        impact_level: u8,
    },
    #[default]
    General,
}

/// A directed, typed relation between two extracted entities
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationTriple {
    pub src: String,
    pub relation: String,
    pub dst: String,
}

impl RelationTriple {
    pub fn new(
        src: impl Into<String>,
        relation: impl Into<String>,
        dst: impl Into<String>,
    ) -> Self {
        Self {
            src: src.into(),
            relation: relation.into(),
            dst: dst.into(),
        }
    }
}

/// The atomic memory unit persisted across both backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Content-addressed identifier (pure function of scope + normalized content)
    pub id: MemoryId,
    /// Owning scope
    pub scope: Scope,
    /// Verbatim content; normalization applies to hashing only
    pub content: String,
    /// Handle the vector store returned on upsert (never assumed to equal id)
    pub embedding_ref: Option<String>,
    /// Entities extracted from the content, in extraction order
    #[serde(default)]
    pub entities: Vec<String>,
    /// Relations extracted from the content
    #[serde(default)]
    pub relations: Vec<RelationTriple>,
    pub category: Category,
    /// Category-specific payload (milestone kind, impact level)
    #[serde(default)]
    pub data: CategoryData,
    /// Confidence on the 1..10 scale
    pub confidence: u8,
    /// Free-form provenance tag
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Incremented on supersession
    pub version: u32,
    pub status: RecordStatus,
    /// Replacement record, set only when status is deprecated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<MemoryId>,
    /// Records this one was flagged against
    #[serde(default)]
    pub conflict_with: Vec<MemoryId>,
    /// Small open-ended string map for genuinely dynamic fields
    #[serde(default)]
    pub extra_metadata: BTreeMap<String, String>,
    /// One backend leg is still pending; the compensation queue owns completion
    #[serde(default)]
    pub degraded: bool,
    /// The extractor failed at write time; graph payload is empty
    #[serde(default)]
    pub extraction_failed: bool,
}

impl MemoryRecord {
    /// True when the record is past its expiry instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }

    /// Milestone payload accessor
    pub fn milestone(&self) -> Option<(MilestoneType, u8)> {
        match self.data {
            CategoryData::Milestone {
                milestone_type,
                impact_level,
            } => Some((milestone_type, impact_level)),
            CategoryData::General => None,
        }
    }
}

/// Input for `save` and `save_verified`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    pub content: String,
    #[serde(default)]
    pub category: Category,
    /// Confidence 1..10; defaults per category when absent
    pub confidence: Option<u8>,
    /// Provenance tag; required by `save_verified`
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Absolute expiry instant; wins over `expires_in_days`
    pub expires_at: Option<DateTime<Utc>>,
    /// Relative expiry in days from now
    pub expires_in_days: Option<i64>,
    #[serde(default)]
    pub extra_metadata: BTreeMap<String, String>,
}

/// Input for `save_milestone`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneRequest {
    pub milestone_type: MilestoneType,
    pub content: String,
    /// Impact significance 1..10
    pub impact_level: u8,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Outcome of a save operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResult {
    pub id: MemoryId,
    pub status: RecordStatus,
    /// False when the write was an idempotent re-save
    pub created: bool,
    /// Peers the new record was flagged against
    pub conflicts: Vec<MemoryId>,
    /// One backend leg is pending; compensation owns completion
    pub degraded: bool,
}

/// Read-side filter applied by search and the quality layer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilter {
    pub category: Option<Category>,
    pub tag: Option<String>,
    /// Drop results below this confidence
    pub min_confidence: Option<u8>,
    /// Restrict to one status instead of the default active-leaning set
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub include_deprecated: bool,
    #[serde(default)]
    pub include_expired: bool,
    #[serde(default)]
    pub include_conflicted: bool,
}

impl SearchFilter {
    /// Preset used by `get_context`: active, non-expired, confident records only
    pub fn context(min_confidence: u8) -> Self {
        Self {
            min_confidence: Some(min_confidence),
            status: Some(RecordStatus::Active),
            ..Default::default()
        }
    }

    /// Whether a record passes this filter at the given instant
    pub fn admits(&self, record: &MemoryRecord, now: DateTime<Utc>) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        } else {
            match record.status {
                RecordStatus::Deprecated if !self.include_deprecated => return false,
                RecordStatus::Expired if !self.include_expired => return false,
                RecordStatus::Conflicted if !self.include_conflicted => return false,
                _ => {}
            }
        }
        if !self.include_expired && record.is_expired_at(now) {
            return false;
        }
        if let Some(min) = self.min_confidence {
            if record.confidence < min {
                return false;
            }
        }
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !record.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

/// How a search result matched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchInfo {
    /// Similarity from the vector path, if it contributed
    pub vector_score: Option<f32>,
    /// Proximity from the graph path, if it contributed
    pub graph_score: Option<f32>,
}

/// A ranked search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: MemoryRecord,
    /// Combined score used for ordering
    pub score: f32,
    pub match_info: MatchInfo,
}

/// Search output with the degradation flag for partial backend outages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    pub results: Vec<ScoredMemory>,
    /// True when one retrieval path was unavailable
    pub degraded: bool,
}

/// One page of records for cursor pagination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back to fetch the next page; None when exhausted
    pub next_cursor: Option<String>,
}

/// Recommendation priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Info => "info",
        }
    }
}

/// A single actionable recommendation in an audit or validation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub issue: String,
    pub action: String,
}

/// Quality audit report over one scope or all scopes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    /// Human-readable audit scope ("scope <hash>" or "all scopes")
    pub audit_scope: String,
    pub generated_at: DateTime<Utc>,
    pub total_memories: usize,
    pub active_memories: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub expired_count: usize,
    pub conflicted_count: usize,
    pub low_confidence_count: usize,
    pub average_confidence: f32,
    /// Fraction of records carrying any extra metadata
    pub metadata_coverage: f32,
    /// 0..100, weighted issue ratio over active records
    pub health_score: u8,
    pub recommendations: Vec<Recommendation>,
}

/// Confidence distribution buckets for a validation report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceDistribution {
    /// confidence >= 8
    pub high: usize,
    /// confidence 5..=7
    pub medium: usize,
    /// confidence < 5
    pub low: usize,
}

/// Project context validation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub project_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_memories: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub expired_count: usize,
    pub conflicted_count: usize,
    pub average_confidence: f32,
    pub metadata_coverage: f32,
    pub confidence_distribution: ConfidenceDistribution,
    pub recommendations: Vec<Recommendation>,
}

/// Derived project phase from milestone count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    /// No milestones yet
    Planning,
    /// 1-2 milestones
    InProgress,
    /// 3-4 milestones
    Advanced,
    /// 5 or more milestones
    Mature,
}

impl ProjectPhase {
    pub fn from_milestone_count(count: usize) -> Self {
        match count {
            0 => ProjectPhase::Planning,
            1..=2 => ProjectPhase::InProgress,
            3..=4 => ProjectPhase::Advanced,
            _ => ProjectPhase::Mature,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectPhase::Planning => "planning",
            ProjectPhase::InProgress => "in_progress",
            ProjectPhase::Advanced => "advanced",
            ProjectPhase::Mature => "mature",
        }
    }
}

/// Current project state rollup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub generated_at: DateTime<Utc>,
    pub phase: ProjectPhase,
    pub total_active_memories: usize,
    /// Most recent milestones, newest first
    pub recent_milestones: Vec<MemoryRecord>,
    /// Most recent status-category record, if any
    pub latest_status: Option<MemoryRecord>,
    /// Non-milestone actives grouped by category, each sorted by confidence desc
    pub by_category: BTreeMap<String, Vec<MemoryRecord>>,
}

/// One event in a project evolution timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: MemoryId,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub category: Category,
    pub status: RecordStatus,
    pub confidence: u8,
    pub version: u32,
    /// Supersession edge to the replacing record
    pub superseded_by: Option<MemoryId>,
    pub milestone_type: Option<MilestoneType>,
    pub impact_level: Option<u8>,
    pub tags: Vec<String>,
}

/// Counters summarizing a project timeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionSummary {
    pub architecture_decisions: usize,
    pub problems_identified: usize,
    pub solutions_implemented: usize,
    pub status_changes: usize,
    pub deprecated_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
}

/// Project evolution timeline, oldest first, deprecated records included
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub project_id: String,
    pub generated_at: DateTime<Utc>,
    pub events: Vec<TimelineEvent>,
    pub summary: EvolutionSummary,
}

/// Relationship profile for a single entity within a scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationships {
    pub entity: String,
    /// Records that mention the entity directly
    pub direct_mentions: usize,
    /// Neighboring entities with shared-record counts, strongest first
    pub related_entities: Vec<(String, usize)>,
    /// Relation type -> edge count
    pub relationship_types: BTreeMap<String, usize>,
    /// direct_mentions / total records in scope, clamped to 0..1
    pub connection_strength: f32,
}

/// Backend capability flags probed at startup
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub vector_available: bool,
    pub graph_available: bool,
    /// True when cache/pub-sub/locks are backed by a shared substrate
    pub distributed: bool,
}

impl Capabilities {
    /// Human-readable retrieval mode, as reported by `graph_status`
    pub fn search_method(&self) -> &'static str {
        match (self.vector_available, self.graph_available) {
            (true, true) => "graph+vector",
            (true, false) => "vector_only",
            (false, true) => "graph_only",
            (false, false) => "unavailable",
        }
    }
}

/// Engine operation counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub saves: u64,
    pub idempotent_saves: u64,
    pub conflicts_detected: u64,
    pub searches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub compensations_enqueued: u64,
    pub compensations_failed: u64,
    pub records_expired: u64,
}
