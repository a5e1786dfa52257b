use std::sync::Arc;

use serde::Serialize;

use super::{JobFailure, ProcessResult};
use crate::DomainResult;
use crate::error::DomainError;
use crate::hierarchy::EntityKind;
use crate::impact::{
    ImpactOptions, StatusImpactEngine, StatusImpactResult, determine_target_status,
};
use crate::jobs::CascadeLevelJob;
use crate::lock::{LockProvider, entity_lock_key};
use crate::ports::jobs::JobRecord;
use crate::ports::store::{HierarchyStore, HierarchyTx};
use crate::queue::CascadeQueueService;
use crate::status::Status;
use crate::validation::StatusValidationService;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LevelCascadeResult {
    pub entity_id: String,
    pub entity_type: EntityKind,
    pub level: u32,
    pub applied_status: Status,
    pub direct_children_updated: u64,
    pub affected_child_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_status: Option<Status>,
    pub next_level_jobs_created: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated: Option<String>,
}

impl LevelCascadeResult {
    fn empty(job: &CascadeLevelJob) -> Self {
        Self {
            entity_id: job.entity_id.clone(),
            entity_type: job.entity_type,
            level: job.level,
            applied_status: job.new_status,
            direct_children_updated: 0,
            affected_child_ids: Vec::new(),
            target_status: None,
            next_level_jobs_created: 0,
            orphan_id: None,
            terminated: None,
        }
    }
}

/// Child correction made by one level job.
struct AppliedLevel {
    child_kind: EntityKind,
    impact: StatusImpactResult,
    /// Children that already hold the level's target status on a
    /// redelivered job. Their follow-on jobs may never have been queued.
    settled_ids: Vec<String>,
}

/// Applies one level of a level cascade: the entity plus its direct
/// children, atomically, then queues the next level after commit.
#[derive(Clone)]
pub struct LevelCascadeProcessor {
    store: Arc<dyn HierarchyStore>,
    locks: Arc<LockProvider>,
    queue: CascadeQueueService,
    engine: StatusImpactEngine,
    validator: StatusValidationService,
}

impl LevelCascadeProcessor {
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

    pub async fn process(&self, record: &JobRecord, job: &CascadeLevelJob) -> ProcessResult {
        let mut result = LevelCascadeResult::empty(job);
        if job.level > job.metadata.total_levels {
            result.terminated = Some(format!(
                "level {} exceeds total levels {}",
                job.level, job.metadata.total_levels
            ));
            return Ok(to_value(&result));
        }

        let key = entity_lock_key(job.entity_type, &job.entity_id);
        let mut tx = self.store.begin().await.map_err(DomainError::from)?;
        let token = match self.locks.acquire_default(tx.as_mut(), &key).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(key = %key, error = %rollback_err, "level rollback failed");
                }
                return Err(DomainError::Transient(format!("could not acquire lock {key}")).into());
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(key = %key, error = %rollback_err, "level rollback failed");
                }
                return Err(err.into());
            }
        };

        let applied = match self.apply(tx.as_mut(), record, job).await {
            Ok(applied) => tx.commit().await.map(|()| applied).map_err(DomainError::from),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(key = %key, error = %rollback_err, "level rollback failed");
                }
                Err(err)
            }
        };
        self.locks.release_quietly(&key, &token).await;

        let applied = applied.map_err(|err| {
            tracing::error!(
                batch_id = %job.batch_id,
                level = job.level,
                entity_type = %job.entity_type,
                entity_id = %job.entity_id,
                error = %err,
                "level cascade failed"
            );
            JobFailure::from(err)
        })?;
        tracing::info!(
            batch_id = %job.batch_id,
            level = job.level,
            entity_type = %job.entity_type,
            entity_id = %job.entity_id,
            path = %job.metadata.current_path,
            "level cascade applied"
        );

        if let Some(applied) = applied {
            result.direct_children_updated = applied.impact.updated_count;
            result.target_status = applied.impact.target_status;
            let next_jobs = self.next_level_jobs(job, &applied);
            result.affected_child_ids = applied.impact.affected_ids;
            if !next_jobs.is_empty() {
                match self.queue.enqueue_level_jobs(&next_jobs).await {
                    Ok(created) => result.next_level_jobs_created = created,
                    Err(err) => {
                        let orphan = self
                            .queue
                            .record_orphan(job, next_jobs, &err.to_string())
                            .await
                            .map_err(JobFailure::from)?;
                        result.orphan_id = Some(orphan.id);
                    }
                }
            }
        }

        if let Err(err) = self.queue.report_progress(record, 100).await {
            tracing::debug!(job_id = %record.job_id, error = %err, "progress update failed");
        }
        Ok(to_value(&result))
    }

    /// Writes inside `tx`. Returns the child correction, if the entity has
    /// children.
    ///
    /// A job is treated as redelivered when it has failed before or its
    /// entity already carries the new status. An earlier run may then have
    /// committed without queueing the next level.
    async fn apply(
        &self,
        tx: &mut dyn HierarchyTx,
        record: &JobRecord,
        job: &CascadeLevelJob,
    ) -> DomainResult<Option<AppliedLevel>> {
        let kind = job.entity_type;
        let loaded = tx
            .find_with_direct_children(kind, &job.entity_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("{kind} {}", job.entity_id)))?;

        // Deeper levels are repairs and bypass the transition table.
        if job.level == 0 {
            self.validator
                .validate_transition(kind, loaded.entity.status, job.new_status)?;
        }
        let redelivered = record.attempts_made > 0 || loaded.entity.status == job.new_status;
        if loaded.entity.status != job.new_status {
            tx.update_status(kind, &job.entity_id, job.new_status).await?;
        }

        let Some(child_kind) = kind.child() else {
            return Ok(None);
        };
        if loaded.children.is_empty() {
            return Ok(None);
        }
        let impact = self
            .engine
            .auto_fix_single_level(
                tx,
                child_kind,
                &loaded.children,
                job.new_status,
                ImpactOptions::default(),
            )
            .await?;

        let settled_ids = match determine_target_status(job.new_status) {
            Some(target) if redelivered && child_kind.child().is_some() => loaded
                .children
                .iter()
                .filter(|child| child.status == target)
                .map(|child| child.id.clone())
                .collect(),
            _ => Vec::new(),
        };
        Ok(Some(AppliedLevel {
            child_kind,
            impact,
            settled_ids,
        }))
    }

    /// Job ids are deterministic, so re-emitting a job that was already
    /// queued is a no-op.
    fn next_level_jobs(
        &self,
        job: &CascadeLevelJob,
        applied: &AppliedLevel,
    ) -> Vec<CascadeLevelJob> {
        let Some(target) = applied
            .impact
            .target_status
            .or_else(|| determine_target_status(job.new_status))
        else {
            return Vec::new();
        };
        if job.level + 1 > job.metadata.total_levels {
            return Vec::new();
        }
        let mut child_ids: Vec<&String> = applied.impact.affected_ids.iter().collect();
        for id in &applied.settled_ids {
            if !child_ids.contains(&id) {
                child_ids.push(id);
            }
        }
        child_ids
            .into_iter()
            .map(|child_id| job.child_job(applied.child_kind, child_id, target))
            .collect()
    }
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::hierarchy::EntityRecord;
    use crate::jobs::{CascadeJob, CascadeMetadata, JobOptions, new_job_record};
    use crate::lock::{InMemoryLockBackend, LockSettings};
    use crate::ports::jobs::{CascadeQueue, QueueName};
    use crate::queue::memory::{InMemoryCascadeQueue, InMemoryDeadLetterStore, InMemoryOrphanLedger};
    use crate::store::InMemoryHierarchyStore;

    fn processor(
        store: &InMemoryHierarchyStore,
    ) -> (LevelCascadeProcessor, Arc<InMemoryCascadeQueue>) {
        let backend = Arc::new(InMemoryCascadeQueue::new());
        let queue = CascadeQueueService::new(
            backend.clone(),
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryOrphanLedger::new()),
            JobOptions::default(),
            50,
        );
        let locks = LockProvider::new(
            Arc::new(InMemoryLockBackend::new()),
            LockSettings::default(),
            CircuitBreakerConfig::default(),
        );
        let processor =
            LevelCascadeProcessor::new(Arc::new(store.clone()), Arc::new(locks), queue);
        (processor, backend)
    }

    fn course_job(level: u32, total_levels: u32) -> CascadeLevelJob {
        CascadeLevelJob {
            batch_id: "batch_1".into(),
            parent_job_id: "batch_1".into(),
            level,
            entity_type: EntityKind::Course,
            entity_id: "co-1".into(),
            new_status: Status::Archived,
            parent_status: None,
            user_id: "u-1".into(),
            metadata: CascadeMetadata {
                total_levels,
                current_path: "course-co-1".into(),
            },
            triggered_at: 0,
            retry_count: 0,
        }
    }

    fn record_for(job: &CascadeLevelJob, attempts_made: u32) -> JobRecord {
        let mut record = new_job_record(
            job.job_id(),
            CascadeJob::Level(job.clone()),
            JobOptions::default(),
            job.level,
        );
        record.attempts_made = attempts_made;
        record
    }

    fn seeded(course: Status, chapter: Status) -> InMemoryHierarchyStore {
        let store = InMemoryHierarchyStore::new();
        store.insert(EntityRecord::new(EntityKind::Course, "co-1", course));
        store.insert(EntityRecord::new(EntityKind::Chapter, "ch-1", chapter).with_parent("co-1"));
        store.insert(
            EntityRecord::new(EntityKind::Lesson, "l-1", Status::Published).with_parent("ch-1"),
        );
        store
    }

    #[tokio::test]
    async fn job_past_last_level_terminates_without_writing() {
        let store = seeded(Status::Published, Status::Published);
        let (processor, queue) = processor(&store);
        let job = course_job(3, 2);

        let value = processor
            .process(&record_for(&job, 0), &job)
            .await
            .expect("terminated job still completes");
        assert_eq!(value["terminated"], "level 3 exceeds total levels 2");
        assert_eq!(value["nextLevelJobsCreated"], 0);
        assert_eq!(store.status_of(EntityKind::Course, "co-1"), Some(Status::Published));
        assert_eq!(store.status_of(EntityKind::Chapter, "ch-1"), Some(Status::Published));
        let counts = queue.counts(QueueName::Level).await.expect("counts");
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn first_delivery_queues_only_corrected_children() {
        let store = seeded(Status::Published, Status::Published);
        let (processor, _) = processor(&store);
        let job = course_job(1, 3);

        let value = processor
            .process(&record_for(&job, 0), &job)
            .await
            .expect("process");
        assert_eq!(value["affectedChildIds"], serde_json::json!(["ch-1"]));
        assert_eq!(value["nextLevelJobsCreated"], 1);
        assert_eq!(store.status_of(EntityKind::Chapter, "ch-1"), Some(Status::Archived));
    }

    #[tokio::test]
    async fn retried_job_requeues_children_already_at_target() {
        let store = seeded(Status::Archived, Status::Archived);
        let (processor, _) = processor(&store);
        let job = course_job(1, 3);

        let value = processor
            .process(&record_for(&job, 1), &job)
            .await
            .expect("process");
        assert_eq!(value["directChildrenUpdated"], 0);
        assert_eq!(value["nextLevelJobsCreated"], 1);
    }
}
