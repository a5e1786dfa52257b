use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::{JobFailure, ProcessResult};
use crate::DomainResult;
use crate::error::DomainError;
use crate::hierarchy::EntityKind;
use crate::impact::{CascadeLevelResult, ImpactOptions, StatusImpactEngine};
use crate::jobs::{CascadeBatchJob, EntityUpdate};
use crate::lock::{LockProvider, LockToken, entity_lock_key};
use crate::ports::jobs::JobRecord;
use crate::ports::store::{HierarchyStore, HierarchyTx};
use crate::queue::CascadeQueueService;
use crate::validation::StatusValidationService;

const MAX_BATCH_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

/// Item locks are held until the whole batch commits, so each one must
/// outlive every item processed after it.
pub fn batch_lock_ttl(per_item: Duration, items: usize) -> Duration {
    let items = u32::try_from(items.max(1)).unwrap_or(u32::MAX);
    per_item.saturating_mul(items).min(MAX_BATCH_LOCK_TTL)
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SingleCascadeResult {
    pub entity_type: EntityKind,
    pub entity_id: String,
    /// Whether the entity's own status was written.
    pub root_updated: bool,
    /// Descendants corrected by the cascade.
    pub total_updated: u64,
    pub affected_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cascaded_levels: Vec<CascadeLevelResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SingleCascadeResult {
    fn failed(update: &EntityUpdate, err: &DomainError) -> Self {
        Self {
            entity_type: update.entity_type,
            entity_id: update.entity_id.clone(),
            root_updated: false,
            total_updated: 0,
            affected_ids: Vec::new(),
            cascaded_levels: Vec::new(),
            error: Some(err.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchCascadeResult {
    pub batch_id: String,
    pub total_updated: u64,
    pub results: Vec<SingleCascadeResult>,
    pub processed_count: usize,
    pub failed_count: usize,
    pub committed: bool,
}

/// Applies every update of a batch job inside one transaction.
///
/// A critical item failure rolls the whole batch back. Other item failures
/// roll back to that item's savepoint; the rest commits and the job still
/// fails so the queue retries it.
#[derive(Clone)]
pub struct BatchCascadeProcessor {
    store: Arc<dyn HierarchyStore>,
    locks: Arc<LockProvider>,
    queue: CascadeQueueService,
    engine: StatusImpactEngine,
    validator: StatusValidationService,
}

impl BatchCascadeProcessor {
    pub fn new(
        store: Arc<dyn HierarchyStore>,
        locks: Arc<LockProvider>,
        queue: CascadeQueueService,
    ) -> Self {
        Self {
            store,
            locks,
            queue,
            engine: StatusImpactEngine::new(),
            validator: StatusValidationService::new(),
        }
    }

    pub async fn process(&self, record: &JobRecord, job: &CascadeBatchJob) -> ProcessResult {
        tracing::info!(
            batch_id = %job.batch_id,
            updates = job.updates.len(),
            attempt = record.attempts_made + 1,
            "batch cascade started"
        );
        let mut tx = self.store.begin().await.map_err(DomainError::from)?;
        let mut held: Vec<(String, LockToken)> = Vec::new();
        let outcome = self.apply_all(tx.as_mut(), record, job, &mut held).await;

        let result = match outcome {
            Ok(mut result) => match tx.commit().await {
                Ok(()) => {
                    result.committed = true;
                    Ok(result)
                }
                Err(err) => Err(JobFailure::from(DomainError::from(err))),
            },
            Err((err, result)) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(batch_id = %job.batch_id, error = %rollback_err, "batch rollback failed");
                }
                Err(JobFailure::with_result(err.to_string(), to_value(&result)))
            }
        };

        for (key, token) in &held {
            self.locks.release_quietly(key, token).await;
        }

        let result = result?;
        if result.failed_count > 0 {
            let reason = format!(
                "Cascade batch partially failed: {}/{} entities failed",
                result.failed_count, result.processed_count
            );
            tracing::warn!(batch_id = %job.batch_id, failed = result.failed_count, "batch cascade partially failed");
            return Err(JobFailure::with_result(reason, to_value(&result)));
        }
        tracing::info!(
            batch_id = %job.batch_id,
            total_updated = result.total_updated,
            "batch cascade committed"
        );
        Ok(to_value(&result))
    }

    async fn apply_all(
        &self,
        tx: &mut dyn HierarchyTx,
        record: &JobRecord,
        job: &CascadeBatchJob,
        held: &mut Vec<(String, LockToken)>,
    ) -> Result<BatchCascadeResult, (DomainError, BatchCascadeResult)> {
        let mut result = BatchCascadeResult {
            batch_id: job.batch_id.clone(),
            total_updated: 0,
            results: Vec::with_capacity(job.updates.len()),
            processed_count: job.updates.len(),
            failed_count: 0,
            committed: false,
        };
        let total = job.updates.len().max(1);
        let lock_ttl = batch_lock_ttl(self.locks.settings().ttl, job.updates.len());

        for (idx, update) in job.updates.iter().enumerate() {
            let savepoint = format!("cascade_item_{idx}");
            let item = match tx.savepoint(&savepoint).await {
                Ok(()) => self.cascade_entity(tx, update, lock_ttl, held).await,
                Err(err) => Err(err.into()),
            };

            match item {
                Ok(single) => {
                    if let Err(err) = tx.release_savepoint(&savepoint).await {
                        return Err((err.into(), result));
                    }
                    result.total_updated += single.total_updated;
                    result.results.push(single);
                }
                Err(err) => {
                    result.failed_count += 1;
                    result.results.push(SingleCascadeResult::failed(update, &err));
                    if err.is_critical() {
                        tracing::error!(
                            batch_id = %job.batch_id,
                            entity_type = %update.entity_type,
                            entity_id = %update.entity_id,
                            error = %err,
                            "critical batch item failure"
                        );
                        return Err((err, result));
                    }
                    tracing::warn!(
                        batch_id = %job.batch_id,
                        entity_type = %update.entity_type,
                        entity_id = %update.entity_id,
                        error = %err,
                        "batch item failed"
                    );
                    if let Err(rollback_err) = tx.rollback_to_savepoint(&savepoint).await {
                        return Err((rollback_err.into(), result));
                    }
                }
            }

            let progress = ((idx + 1) * 100 / total) as u8;
            if let Err(err) = self.queue.report_progress(record, progress).await {
                tracing::debug!(batch_id = %job.batch_id, error = %err, "progress update failed");
            }
        }
        Ok(result)
    }

    async fn cascade_entity(
        &self,
        tx: &mut dyn HierarchyTx,
        update: &EntityUpdate,
        lock_ttl: Duration,
        held: &mut Vec<(String, LockToken)>,
    ) -> DomainResult<SingleCascadeResult> {
        let kind = update.entity_type;
        let key = entity_lock_key(kind, &update.entity_id);
        if !held.iter().any(|(held_key, _)| *held_key == key) {
            let token = self
                .locks
                .acquire_with_retry(tx, &key, lock_ttl, self.locks.settings().retry_attempts)
                .await?
                .ok_or_else(|| DomainError::Transient(format!("could not acquire lock {key}")))?;
            held.push((key, token));
        }

        let loaded = tx
            .find_with_direct_children(kind, &update.entity_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("{kind} {}", update.entity_id)))?;
        let current = loaded.entity.status;
        self.validator
            .validate_transition_with_parent(kind, current, update.new_status, loaded.parent_status)?;

        let root_updated = if current != update.new_status {
            tx.update_status(kind, &update.entity_id, update.new_status)
                .await?
        } else {
            false
        };

        let levels = self.engine.load_subtree(tx, kind, loaded.children).await?;
        let impact = self
            .engine
            .auto_fix_multi_level(tx, update.new_status, &levels, ImpactOptions::default())
            .await?;

        Ok(SingleCascadeResult {
            entity_type: kind,
            entity_id: update.entity_id.clone(),
            root_updated,
            total_updated: impact.updated_count,
            affected_ids: impact.affected_ids,
            cascaded_levels: impact.cascaded_levels,
            error: None,
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_lock_ttl_scales_with_items_up_to_cap() {
        let per_item = Duration::from_secs(5);
        assert_eq!(batch_lock_ttl(per_item, 0), per_item);
        assert_eq!(batch_lock_ttl(per_item, 1), per_item);
        assert_eq!(batch_lock_ttl(per_item, 12), Duration::from_secs(60));
        assert_eq!(batch_lock_ttl(per_item, 500), MAX_BATCH_LOCK_TTL);
        assert_eq!(batch_lock_ttl(per_item, usize::MAX), MAX_BATCH_LOCK_TTL);
    }
}
