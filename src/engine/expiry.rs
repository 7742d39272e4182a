//! Expiry sweeper
//!
//! Flips `active -> expired` for records past their expiry instant and
//! announces each flip exactly once. Expired records are never deleted;
//! they stay retrievable through the evolution endpoints.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{ChangeEvent, Topic};
use crate::fingerprint::scope_hash;
use crate::types::{MemoryId, RecordStatus, Scope};

use super::{MemoryEngine, SweepMark};

/// Outcome of one sweep over one scope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: Vec<MemoryId>,
}

impl MemoryEngine {
    /// Sweep one scope. Idempotent: a record flips at most once, and a scope
    /// with no expiry due since the last sweep is skipped via its high-water
    /// mark.
    pub async fn sweep_expired(&self, scope: &Scope) -> Result<SweepReport> {
        scope.validate()?;
        let now = self.now();
        let hash = scope_hash(scope);

        if let Some(mark) = self.sweep_marks.get(&hash) {
            let nothing_due = match mark.next_due {
                Some(due) => due > now,
                None => mark.last_swept.is_some(),
            };
            if nothing_due {
                return Ok(SweepReport::default());
            }
        }

        let mut report = SweepReport::default();
        let mut next_due = None;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .with_budget(
                    "vector.list",
                    self.ports.vector.list(scope, cursor.as_deref(), 200),
                )
                .await?;
            for mut record in page.items {
                report.scanned += 1;
                if record.status == RecordStatus::Active && record.is_expired_at(now) {
                    record.status = RecordStatus::Expired;
                    record.updated_at = now;
                    self.ports.vector.update_metadata(scope, &record).await?;
                    self.publish(
                        ChangeEvent::new(Topic::MemoryExpired, hash.clone(), now)
                            .with_id(record.id.clone()),
                    )
                    .await?;
                    report.expired.push(record.id);
                } else if record.status == RecordStatus::Active {
                    if let Some(expires) = record.expires_at {
                        next_due = Some(match next_due {
                            Some(current) if current < expires => current,
                            _ => expires,
                        });
                    }
                }
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        if !report.expired.is_empty() {
            self.stats.expired(report.expired.len() as u64);
            self.invalidate_scope(scope).await?;
        }
        self.sweep_marks.insert(
            hash.clone(),
            SweepMark {
                next_due,
                last_swept: Some(now),
            },
        );
        debug!(scope = %hash, expired = report.expired.len(), scanned = report.scanned, "sweep complete");
        Ok(report)
    }

    /// Sweep every scope that has seen a write, concurrently
    pub async fn sweep_all(&self) -> Result<Vec<(Scope, SweepReport)>> {
        let scopes: Vec<Scope> = self
            .known_scopes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let sweeps = futures::future::join_all(scopes.iter().map(|s| self.sweep_expired(s))).await;
        scopes
            .into_iter()
            .zip(sweeps)
            .map(|(scope, report)| Ok((scope, report?)))
            .collect()
    }

    /// Run the sweeper on the configured interval (production mode; tests
    /// call `sweep_expired` directly)
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep_all().await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }
        })
    }

    /// Keep the scope's high-water mark aware of a newly written expiry
    pub(crate) fn note_upcoming_expiry(
        &self,
        scope: &Scope,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        let Some(expires_at) = expires_at else {
            return;
        };
        let mut mark = self.sweep_marks.entry(scope_hash(scope)).or_default();
        mark.next_due = Some(match mark.next_due {
            Some(current) if current < expires_at => current,
            _ => expires_at,
        });
    }
}
