//! Project state and evolution rollups
//!
//! Milestones drive the derived project phase; the evolution timeline keeps
//! deprecated and expired records so supersession history stays visible.

use std::collections::BTreeMap;

use crate::error::{MemoriaError, Result};
use crate::types::{
    Category, EvolutionSummary, MemoryRecord, MilestoneType, ProjectPhase, ProjectState,
    RecordStatus, Scope, Timeline, TimelineEvent,
};

use crate::engine::MemoryEngine;

/// How many recent milestones a project state carries
const RECENT_MILESTONES: usize = 5;

impl MemoryEngine {
    /// Current state of a project: recent milestones, latest status record,
    /// actives grouped by category, and the derived phase
    pub async fn get_project_state(&self, scope: &Scope) -> Result<ProjectState> {
        scope.validate()?;
        let Some(project_id) = scope.project.clone() else {
            return Err(MemoriaError::InvalidInput(
                "project state requires a project-qualified scope".to_string(),
            ));
        };
        let now = self.now();
        let records = self.collect_scope(scope).await?;

        let actives: Vec<&MemoryRecord> = records
            .iter()
            .filter(|r| r.status == RecordStatus::Active && !r.is_expired_at(now))
            .collect();

        let mut milestones: Vec<&MemoryRecord> = actives
            .iter()
            .copied()
            .filter(|r| r.milestone().is_some())
            .collect();
        milestones.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let milestone_count = milestones.len();

        let latest_status = actives
            .iter()
            .copied()
            .filter(|r| r.category == Category::Status)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .cloned();

        let mut by_category: BTreeMap<String, Vec<MemoryRecord>> = BTreeMap::new();
        for record in actives.iter().filter(|r| r.milestone().is_none()) {
            by_category
                .entry(record.category.as_str().to_string())
                .or_default()
                .push((*record).clone());
        }
        for group in by_category.values_mut() {
            group.sort_by(|a, b| {
                b.confidence
                    .cmp(&a.confidence)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
        }

        Ok(ProjectState {
            project_id,
            generated_at: now,
            phase: ProjectPhase::from_milestone_count(milestone_count),
            total_active_memories: actives.len(),
            recent_milestones: milestones
                .into_iter()
                .take(RECENT_MILESTONES)
                .cloned()
                .collect(),
            latest_status,
            by_category,
        })
    }

    /// Evolution timeline of a project, oldest first, including deprecated
    /// and expired records with their supersession edges
    pub async fn track_evolution(
        &self,
        scope: &Scope,
        limit: Option<usize>,
    ) -> Result<Timeline> {
        scope.validate()?;
        let Some(project_id) = scope.project.clone() else {
            return Err(MemoriaError::InvalidInput(
                "evolution tracking requires a project-qualified scope".to_string(),
            ));
        };
        let mut records = self.collect_scope(scope).await?;
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        // The limit keeps the newest part of the history
        if let Some(limit) = limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }

        let mut summary = EvolutionSummary::default();
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match record.status {
                RecordStatus::Deprecated => summary.deprecated_entries += 1,
                RecordStatus::Expired => summary.expired_entries += 1,
                RecordStatus::Active => summary.active_entries += 1,
                RecordStatus::Conflicted => {}
            }
            let (milestone_type, impact_level) = match record.milestone() {
                Some((milestone_type, impact_level)) => {
                    match milestone_type {
                        MilestoneType::ArchitectureDecision => {
                            summary.architecture_decisions += 1
                        }
                        MilestoneType::ProblemIdentified => summary.problems_identified += 1,
                        MilestoneType::SolutionImplemented => {
                            summary.solutions_implemented += 1
                        }
                        MilestoneType::StatusChange => summary.status_changes += 1,
                    }
                    (Some(milestone_type), Some(impact_level))
                }
                None => (None, None),
            };
            events.push(TimelineEvent {
                id: record.id,
                timestamp: record.created_at,
                content: record.content,
                category: record.category,
                status: record.status,
                confidence: record.confidence,
                version: record.version,
                superseded_by: record.superseded_by,
                milestone_type,
                impact_level,
                tags: record.tags,
            });
        }

        Ok(Timeline {
            project_id,
            generated_at: self.now(),
            events,
            summary,
        })
    }
}
