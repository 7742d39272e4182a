//! Quality audits and project context validation
//!
//! Both reports enumerate a scope and reduce it to counts, distributions,
//! a weighted health score, and prioritized recommendations. The audit can
//! also run across every known scope, which requires an operator identity.

use std::collections::BTreeMap;

use crate::error::{MemoriaError, Result};
use crate::fingerprint::scope_hash;
use crate::types::{
    ConfidenceDistribution, MemoryRecord, Priority, QualityReport, Recommendation, RecordStatus,
    Scope, ValidationReport,
};

use crate::engine::MemoryEngine;

/// Counts shared by both report types
struct ScopeTally {
    total: usize,
    by_status: BTreeMap<String, usize>,
    by_category: BTreeMap<String, usize>,
    expired: usize,
    conflicted: usize,
    low_confidence: usize,
    needs_validation: usize,
    average_confidence: f32,
    metadata_coverage: f32,
    distribution: ConfidenceDistribution,
}

impl MemoryEngine {
    /// Fetch every record of a scope via cursor pagination
    pub(crate) async fn collect_scope(&self, scope: &Scope) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .with_budget(
                    "vector.list",
                    self.ports.vector.list(scope, cursor.as_deref(), 500),
                )
                .await?;
            records.extend(page.items);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(records)
    }

    fn tally(&self, records: &[MemoryRecord]) -> ScopeTally {
        let now = self.now();
        let floor = self.config.quality.low_confidence_floor;
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut distribution = ConfidenceDistribution::default();
        let mut expired = 0;
        let mut conflicted = 0;
        let mut low_confidence = 0;
        let mut needs_validation = 0;
        let mut with_metadata = 0;
        let mut confidence_sum: u64 = 0;

        for record in records {
            *by_status
                .entry(record.status.as_str().to_string())
                .or_insert(0) += 1;
            *by_category
                .entry(record.category.as_str().to_string())
                .or_insert(0) += 1;
            if record.status == RecordStatus::Expired || record.is_expired_at(now) {
                expired += 1;
            }
            if record.status == RecordStatus::Conflicted {
                conflicted += 1;
            }
            if record.confidence < floor {
                low_confidence += 1;
            }
            if record.confidence < 7 {
                needs_validation += 1;
            }
            if !record.extra_metadata.is_empty() {
                with_metadata += 1;
            }
            confidence_sum += record.confidence as u64;
            match record.confidence {
                8..=10 => distribution.high += 1,
                5..=7 => distribution.medium += 1,
                _ => distribution.low += 1,
            }
        }

        let total = records.len();
        ScopeTally {
            total,
            by_status,
            by_category,
            expired,
            conflicted,
            low_confidence,
            needs_validation,
            average_confidence: if total == 0 {
                0.0
            } else {
                confidence_sum as f32 / total as f32
            },
            metadata_coverage: if total == 0 {
                0.0
            } else {
                with_metadata as f32 / total as f32
            },
            distribution,
        }
    }

    /// 0..100 from the weighted issue ratio over active records
    fn health_score(&self, tally: &ScopeTally) -> u8 {
        let deprecated = tally
            .by_status
            .get(RecordStatus::Deprecated.as_str())
            .copied()
            .unwrap_or(0);
        let active = tally.total.saturating_sub(deprecated);
        if active == 0 {
            return 100;
        }
        let weights = &self.config.quality;
        let issues = tally.expired as f32 * weights.expired
            + tally.conflicted as f32 * weights.conflicted
            + tally.low_confidence as f32 * weights.low_confidence;
        let ratio = (issues / active as f32).clamp(0.0, 1.0);
        ((1.0 - ratio) * 100.0).round() as u8
    }

    fn recommendations(&self, tally: &ScopeTally, health_score: u8) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();
        if tally.conflicted > 0 {
            recommendations.push(Recommendation {
                priority: Priority::Critical,
                issue: format!("{} conflicted memories", tally.conflicted),
                action: "Resolve contradictions with resolve_conflict".to_string(),
            });
        }
        if tally.expired > 0 {
            recommendations.push(Recommendation {
                priority: Priority::High,
                issue: format!("{} expired memories", tally.expired),
                action: "Re-verify or supersede expired information".to_string(),
            });
        }
        if tally.low_confidence > 0 {
            recommendations.push(Recommendation {
                priority: Priority::Medium,
                issue: format!("{} low-confidence memories", tally.low_confidence),
                action: "Verify accuracy or remove uncertain records".to_string(),
            });
        }
        if tally.needs_validation > 0 {
            recommendations.push(Recommendation {
                priority: Priority::Medium,
                issue: format!("{} memories below the verification floor", tally.needs_validation),
                action: "Validate flagged records and re-save them as verified".to_string(),
            });
        }
        let (priority, issue, action) = match health_score {
            90..=100 => (
                Priority::Info,
                "Memory quality is excellent".to_string(),
                "Keep current memory management practices".to_string(),
            ),
            70..=89 => (
                Priority::Info,
                "Memory quality is good".to_string(),
                "Address minor issues to improve context accuracy".to_string(),
            ),
            _ => (
                Priority::Critical,
                "Memory quality needs attention".to_string(),
                "Clean up conflicts and expired records to restore reliable context".to_string(),
            ),
        };
        recommendations.push(Recommendation {
            priority,
            issue,
            action,
        });
        recommendations
    }

    /// Quality audit over one scope, or over every known scope when `scope`
    /// is `None` (which requires an operator identity)
    pub async fn audit_quality(
        &self,
        scope: Option<&Scope>,
        operator: Option<&str>,
    ) -> Result<QualityReport> {
        let (records, audit_scope) = match scope {
            Some(scope) => {
                scope.validate()?;
                (
                    self.collect_scope(scope).await?,
                    format!("scope {}", scope_hash(scope)),
                )
            }
            None => {
                if operator.map(|o| o.trim().is_empty()).unwrap_or(true) {
                    return Err(MemoriaError::InvalidInput(
                        "cross-scope audit requires an operator identity".to_string(),
                    ));
                }
                let mut records = Vec::new();
                let scopes: Vec<Scope> = self
                    .known_scopes
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for scope in scopes {
                    records.extend(self.collect_scope(&scope).await?);
                }
                (records, "all scopes".to_string())
            }
        };

        let tally = self.tally(&records);
        let health_score = self.health_score(&tally);
        let recommendations = self.recommendations(&tally, health_score);
        let deprecated = tally
            .by_status
            .get(RecordStatus::Deprecated.as_str())
            .copied()
            .unwrap_or(0);

        Ok(QualityReport {
            audit_scope,
            generated_at: self.now(),
            total_memories: tally.total,
            active_memories: tally.total.saturating_sub(deprecated),
            by_status: tally.by_status,
            by_category: tally.by_category,
            expired_count: tally.expired,
            conflicted_count: tally.conflicted,
            low_confidence_count: tally.low_confidence,
            average_confidence: tally.average_confidence,
            metadata_coverage: tally.metadata_coverage,
            health_score,
            recommendations,
        })
    }

    /// Validate one project's context; the scope must carry a project id
    pub async fn validate_project(&self, scope: &Scope) -> Result<ValidationReport> {
        scope.validate()?;
        let Some(project_id) = scope.project.clone() else {
            return Err(MemoriaError::InvalidInput(
                "validation requires a project-qualified scope".to_string(),
            ));
        };
        let records = self.collect_scope(scope).await?;
        let tally = self.tally(&records);
        let health_score = self.health_score(&tally);
        let recommendations = self.recommendations(&tally, health_score);

        Ok(ValidationReport {
            project_id,
            generated_at: self.now(),
            total_memories: tally.total,
            by_status: tally.by_status,
            by_category: tally.by_category,
            expired_count: tally.expired,
            conflicted_count: tally.conflicted,
            average_confidence: tally.average_confidence,
            metadata_coverage: tally.metadata_coverage,
            confidence_distribution: tally.distribution,
            recommendations,
        })
    }
}
