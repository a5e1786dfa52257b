//! Job lifecycle for the batch and level cascade queues.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::DomainResult;
use crate::error::DomainError;
use crate::hierarchy::EntityKind;
use crate::jobs::{
    CascadeBatchJob, CascadeJob, CascadeLevelJob, CascadeMetadata, DAY_MS, DeadLetterEntry,
    EntityUpdate, HOUR_MS, JobOptions, OrphanedCascade, backoff_ms, cutoff_ms, new_batch_id,
    new_job_record, now_ms, sort_updates_by_order,
};
use crate::ports::jobs::{
    CascadeQueue, DeadLetterStore, JobCounts, JobRecord, JobState, OrphanLedger, QueueName,
};
use crate::status::Status;
use crate::util::uuid_v7_without_dashes;

pub const DEFAULT_ENQUEUE_CHUNK_SIZE: usize = 50;
const HEALTH_MAX_ACTIVE: u64 = 1_000;
const HEALTH_MAX_WAITING: u64 = 5_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { delay_ms: u64, attempt: u32 },
    DeadLettered { entry_id: String },
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusInfo {
    pub id: String,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<&JobRecord> for JobStatusInfo {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.job_id.clone(),
            state: record.state,
            progress: record.progress,
            attempts_made: record.attempts_made,
            failed_reason: record.failure_reason.clone(),
            result: record.result.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LevelProgress {
    pub level: u32,
    pub total: u64,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LevelJobStats {
    pub total: u64,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub by_level: Vec<LevelProgress>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_id: String,
    pub batch_job: Option<JobStatusInfo>,
    pub level_jobs: LevelJobStats,
    pub orphaned: Vec<OrphanedCascade>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    pub cancelled: u64,
    pub already_completed: u64,
    pub already_active: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterCount {
    pub total: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub batch_queue: JobCounts,
    pub level_queue: JobCounts,
    pub dead_letter_queue: DeadLetterCount,
    pub orphaned: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub batch_queue: u64,
    pub level_queue: u64,
    pub dlq: u64,
    pub total: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionBucket {
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_timestamp: Option<i64>,
}

impl RetentionBucket {
    fn from_timestamps(timestamps: impl Iterator<Item = i64>) -> Self {
        let mut bucket = Self::default();
        for timestamp in timestamps {
            bucket.total += 1;
            bucket.oldest_timestamp = Some(
                bucket
                    .oldest_timestamp
                    .map_or(timestamp, |oldest| oldest.min(timestamp)),
            );
        }
        bucket
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueRetention {
    pub completed: RetentionBucket,
    pub failed: RetentionBucket,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionStats {
    pub batch_queue: QueueRetention,
    pub level_queue: QueueRetention,
    pub dlq: RetentionBucket,
}

impl RetentionStats {
    pub fn total_completed(&self) -> u64 {
        self.batch_queue.completed.total + self.level_queue.completed.total
    }

    pub fn total_failed(&self) -> u64 {
        self.batch_queue.failed.total + self.level_queue.failed.total + self.dlq.total
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobs {
    pub batch_queue: Vec<JobRecord>,
    pub level_queue: Vec<JobRecord>,
    pub dlq: Vec<DeadLetterEntry>,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub status: HealthStatus,
    pub batch_queue: JobCounts,
    pub level_queue: JobCounts,
    pub total_active: u64,
    pub total_waiting: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub id: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub reconciled: u64,
    pub requeued_jobs: u64,
    pub failed: Vec<ItemError>,
}

#[derive(Clone)]
pub struct CascadeQueueService {
    queue: Arc<dyn CascadeQueue>,
    dead_letters: Arc<dyn DeadLetterStore>,
    orphans: Arc<dyn OrphanLedger>,
    options: JobOptions,
    enqueue_chunk_size: usize,
}

impl CascadeQueueService {
    pub fn new(
        queue: Arc<dyn CascadeQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
        orphans: Arc<dyn OrphanLedger>,
        options: JobOptions,
        enqueue_chunk_size: usize,
    ) -> Self {
        Self {
            queue,
            dead_letters,
            orphans,
            options,
            enqueue_chunk_size: enqueue_chunk_size.max(1),
        }
    }

    pub fn options(&self) -> JobOptions {
        self.options
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    /// Enqueues a batch job under a fresh batch id. Updates are reordered
    /// ancestors first.
    pub async fn add_batch_cascade_job(
        &self,
        mut updates: Vec<EntityUpdate>,
        user_id: &str,
    ) -> DomainResult<String> {
        sort_updates_by_order(&mut updates);
        let job = CascadeBatchJob {
            batch_id: new_batch_id(),
            updates,
            user_id: user_id.to_string(),
            triggered_at: now_ms(),
            retry_count: 0,
            failure_reason: None,
        };
        self.enqueue_batch_job(job).await
    }

    pub async fn enqueue_batch_job(&self, job: CascadeBatchJob) -> DomainResult<String> {
        let batch_id = job.batch_id.clone();
        let updates = job.updates.len();
        let record = new_job_record(batch_id.clone(), CascadeJob::Batch(job), self.options, 0);
        if !self.queue.add(&record).await? {
            return Err(DomainError::Conflict(format!("batch {batch_id} already queued")));
        }
        tracing::info!(batch_id = %batch_id, updates, "batch cascade queued");
        Ok(batch_id)
    }

    /// Enqueues the level-0 job of a new level cascade and returns its batch id.
    pub async fn start_level_based_cascade(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        new_status: Status,
        user_id: &str,
    ) -> DomainResult<String> {
        let batch_id = new_batch_id();
        let job = CascadeLevelJob {
            batch_id: batch_id.clone(),
            parent_job_id: batch_id.clone(),
            level: 0,
            entity_type,
            entity_id: entity_id.to_string(),
            new_status,
            parent_status: None,
            user_id: user_id.to_string(),
            metadata: CascadeMetadata {
                total_levels: entity_type.max_cascade_levels(),
                current_path: format!("{entity_type}-{entity_id}"),
            },
            triggered_at: now_ms(),
            retry_count: 0,
        };
        let job_id = job.job_id();
        self.enqueue_level_job_as(job, job_id).await?;
        tracing::info!(
            batch_id = %batch_id,
            entity_type = %entity_type,
            entity_id,
            new_status = %new_status,
            "level cascade queued"
        );
        Ok(batch_id)
    }

    /// Enqueues a level job under an explicit job id.
    pub async fn enqueue_level_job_as(
        &self,
        job: CascadeLevelJob,
        job_id: String,
    ) -> DomainResult<String> {
        let priority = job.level;
        let record = new_job_record(job_id.clone(), CascadeJob::Level(job), self.options, priority);
        if !self.queue.add(&record).await? {
            return Err(DomainError::Conflict(format!("level job {job_id} already queued")));
        }
        Ok(job_id)
    }

    /// Enqueues follow-on level jobs in chunks. Jobs already queued under the
    /// same identity are skipped, so re-enqueueing is harmless.
    pub async fn enqueue_level_jobs(&self, jobs: &[CascadeLevelJob]) -> DomainResult<usize> {
        let mut inserted = 0usize;
        for chunk in jobs.chunks(self.enqueue_chunk_size) {
            let records: Vec<JobRecord> = chunk
                .iter()
                .map(|job| {
                    new_job_record(
                        job.job_id(),
                        CascadeJob::Level(job.clone()),
                        self.options,
                        job.level,
                    )
                })
                .collect();
            inserted += self.queue.add_bulk(&records).await?;
        }
        Ok(inserted)
    }

    pub async fn next_job(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> DomainResult<Option<JobRecord>> {
        Ok(self.queue.dequeue(queue, timeout).await?)
    }

    pub async fn report_progress(&self, record: &JobRecord, progress: u8) -> DomainResult<()> {
        self.queue
            .update_progress(record.queue, &record.job_id, progress)
            .await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        record: &JobRecord,
        result: serde_json::Value,
    ) -> DomainResult<()> {
        self.queue
            .complete(record.queue, &record.job_id, result, now_ms())
            .await?;
        Ok(())
    }

    /// Consumes one attempt. Schedules a backoff retry, or fails the job and
    /// moves it to the dead-letter store once attempts are exhausted.
    pub async fn handle_failure(
        &self,
        record: &JobRecord,
        reason: &str,
        result: Option<serde_json::Value>,
    ) -> DomainResult<FailureOutcome> {
        let mut updated = record.clone();
        updated.attempts_made += 1;
        updated.failure_reason = Some(reason.to_string());
        if result.is_some() {
            updated.result = result;
        }

        if !updated.attempts_exhausted() {
            let delay_ms = backoff_ms(
                self.options.backoff_base_ms,
                updated.attempts_made,
                self.options.backoff_max_ms,
            );
            updated.run_at_ms = now_ms() + delay_ms as i64;
            self.queue.retry_later(&updated).await?;
            tracing::warn!(
                queue = %record.queue,
                job_id = %record.job_id,
                attempt = updated.attempts_made,
                delay_ms,
                reason,
                "cascade job will be retried"
            );
            return Ok(FailureOutcome::Retrying {
                delay_ms,
                attempt: updated.attempts_made,
            });
        }

        let now = now_ms();
        updated.finished_at_ms = Some(now);
        self.queue.fail(&updated).await?;
        let entry = self.move_to_dead_letter_queue(&updated, reason, now).await?;
        Ok(FailureOutcome::DeadLettered { entry_id: entry.id })
    }

    async fn move_to_dead_letter_queue(
        &self,
        record: &JobRecord,
        reason: &str,
        failed_at: i64,
    ) -> DomainResult<DeadLetterEntry> {
        let mut job = record.payload.clone();
        if let CascadeJob::Batch(batch) = &mut job {
            batch.failure_reason = Some(reason.to_string());
        }
        let entry = DeadLetterEntry {
            id: format!("dlq_{}", uuid_v7_without_dashes()),
            original_job_id: record.job_id.clone(),
            job,
            failure_reason: reason.to_string(),
            failed_at,
            retry_count: record.attempts_made,
        };
        self.dead_letters.push(&entry).await?;
        tracing::error!(
            queue = %record.queue,
            job_id = %record.job_id,
            dlq_id = %entry.id,
            attempts = record.attempts_made,
            reason,
            "cascade job dead-lettered"
        );
        Ok(entry)
    }

    pub async fn get_batch_progress(&self, batch_id: &str) -> DomainResult<BatchProgress> {
        let batch_job = self.queue.get(QueueName::Batch, batch_id).await?;
        let level_jobs = self.queue.list_batch(QueueName::Level, batch_id).await?;
        let orphaned = self.orphans.list_batch(batch_id).await?;

        let mut stats = LevelJobStats::default();
        let mut by_level: BTreeMap<u32, LevelProgress> = BTreeMap::new();
        for record in &level_jobs {
            let CascadeJob::Level(job) = &record.payload else {
                continue;
            };
            let level = by_level.entry(job.level).or_insert_with(|| LevelProgress {
                level: job.level,
                ..LevelProgress::default()
            });
            level.total += 1;
            stats.total += 1;
            match record.state {
                JobState::Completed => {
                    level.completed += 1;
                    stats.completed += 1;
                }
                JobState::Failed => {
                    level.failed += 1;
                    stats.failed += 1;
                }
                JobState::Active => {
                    level.active += 1;
                    stats.active += 1;
                }
                JobState::Waiting | JobState::Delayed => {
                    level.waiting += 1;
                    stats.waiting += 1;
                }
            }
        }
        stats.by_level = by_level.into_values().collect();

        Ok(BatchProgress {
            batch_id: batch_id.to_string(),
            batch_job: batch_job.as_ref().map(JobStatusInfo::from),
            level_jobs: stats,
            orphaned,
        })
    }

    /// Removes the batch's waiting and delayed jobs. Active and finished
    /// jobs are only counted.
    pub async fn cancel_batch_cascade(&self, batch_id: &str) -> DomainResult<CancelResult> {
        let mut records = self.queue.list_batch(QueueName::Level, batch_id).await?;
        if let Some(batch) = self.queue.get(QueueName::Batch, batch_id).await? {
            records.push(batch);
        }

        let mut result = CancelResult::default();
        for record in records {
            match record.state {
                JobState::Completed => result.already_completed += 1,
                JobState::Active => result.already_active += 1,
                JobState::Waiting | JobState::Delayed => {
                    if self.queue.remove(record.queue, &record.job_id).await? {
                        result.cancelled += 1;
                    }
                }
                JobState::Failed => {}
            }
        }
        tracing::info!(
            batch_id,
            cancelled = result.cancelled,
            already_active = result.already_active,
            already_completed = result.already_completed,
            "cascade cancelled"
        );
        Ok(result)
    }

    pub async fn get_queue_metrics(&self) -> DomainResult<QueueMetrics> {
        Ok(QueueMetrics {
            batch_queue: self.queue.counts(QueueName::Batch).await?,
            level_queue: self.queue.counts(QueueName::Level).await?,
            dead_letter_queue: DeadLetterCount {
                total: self.dead_letters.list().await?.len() as u64,
            },
            orphaned: self.orphans.list().await?.len() as u64,
        })
    }

    pub async fn health(&self) -> DomainResult<QueueHealth> {
        let batch_queue = self.queue.counts(QueueName::Batch).await?;
        let level_queue = self.queue.counts(QueueName::Level).await?;
        let total_active = batch_queue.active + level_queue.active;
        let total_waiting = batch_queue.waiting + level_queue.waiting;
        let status = if total_active < HEALTH_MAX_ACTIVE && total_waiting < HEALTH_MAX_WAITING {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Ok(QueueHealth {
            status,
            batch_queue,
            level_queue,
            total_active,
            total_waiting,
        })
    }

    pub async fn cleanup_completed_jobs(&self, older_than_hours: u64) -> DomainResult<CleanupResult> {
        let cutoff = cutoff_ms(now_ms(), older_than_hours, HOUR_MS);
        let batch_queue = self
            .remove_finished_before(QueueName::Batch, JobState::Completed, cutoff)
            .await?;
        let level_queue = self
            .remove_finished_before(QueueName::Level, JobState::Completed, cutoff)
            .await?;
        Ok(CleanupResult {
            batch_queue,
            level_queue,
            dlq: 0,
            total: batch_queue + level_queue,
        })
    }

    /// Removes failed jobs and dead-letter entries older than the window.
    pub async fn cleanup_failed_jobs(&self, older_than_days: u64) -> DomainResult<CleanupResult> {
        let cutoff = cutoff_ms(now_ms(), older_than_days, DAY_MS);
        let batch_queue = self
            .remove_finished_before(QueueName::Batch, JobState::Failed, cutoff)
            .await?;
        let level_queue = self
            .remove_finished_before(QueueName::Level, JobState::Failed, cutoff)
            .await?;
        let dlq = self.purge_dead_letters_before(cutoff).await?;
        Ok(CleanupResult {
            batch_queue,
            level_queue,
            dlq,
            total: batch_queue + level_queue + dlq,
        })
    }

    pub async fn purge_dead_letters_before(&self, cutoff_ms: i64) -> DomainResult<u64> {
        let mut purged = 0;
        for entry in self.dead_letters.list().await? {
            if entry.failed_at < cutoff_ms && self.dead_letters.remove(&entry.id).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn remove_finished_before(
        &self,
        queue: QueueName,
        state: JobState,
        cutoff_ms: i64,
    ) -> DomainResult<u64> {
        let mut removed = 0;
        for record in self.queue.list(queue, &[state]).await? {
            if record.finished_or_created_ms() < cutoff_ms
                && self.queue.remove(queue, &record.job_id).await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn retention_stats(&self) -> DomainResult<RetentionStats> {
        let mut stats = RetentionStats::default();
        for queue in QueueName::ALL {
            let completed = self.queue.list(queue, &[JobState::Completed]).await?;
            let failed = self.queue.list(queue, &[JobState::Failed]).await?;
            let retention = QueueRetention {
                completed: RetentionBucket::from_timestamps(
                    completed.iter().map(JobRecord::finished_or_created_ms),
                ),
                failed: RetentionBucket::from_timestamps(
                    failed.iter().map(JobRecord::finished_or_created_ms),
                ),
            };
            match queue {
                QueueName::Batch => stats.batch_queue = retention,
                QueueName::Level => stats.level_queue = retention,
            }
        }
        let dead_letters = self.dead_letters.list().await?;
        stats.dlq = RetentionBucket::from_timestamps(dead_letters.iter().map(|entry| entry.failed_at));
        Ok(stats)
    }

    /// Re-queues a job sitting in the `failed` state with a fresh attempt
    /// budget.
    pub async fn retry_failed_job(&self, queue: QueueName, job_id: &str) -> DomainResult<String> {
        let record = self
            .queue
            .get(queue, job_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("job {job_id} in {queue} queue")))?;
        if record.state != JobState::Failed {
            return Err(DomainError::Conflict(format!(
                "job {job_id} is not in failed state (current: {})",
                record.state.as_str()
            )));
        }
        let mut retried = record;
        retried.attempts_made = 0;
        retried.failure_reason = None;
        retried.finished_at_ms = None;
        retried.progress = 0;
        retried.run_at_ms = now_ms();
        self.queue.retry_later(&retried).await?;
        tracing::info!(queue = %queue, job_id, "failed job re-queued");
        Ok(job_id.to_string())
    }

    pub async fn list_failed_jobs(&self) -> DomainResult<FailedJobs> {
        Ok(FailedJobs {
            batch_queue: self.queue.list(QueueName::Batch, &[JobState::Failed]).await?,
            level_queue: self.queue.list(QueueName::Level, &[JobState::Failed]).await?,
            dlq: self.dead_letters.list().await?,
        })
    }

    /// Records a committed level whose follow-on jobs never reached the queue.
    pub async fn record_orphan(
        &self,
        job: &CascadeLevelJob,
        pending_jobs: Vec<CascadeLevelJob>,
        reason: &str,
    ) -> DomainResult<OrphanedCascade> {
        let orphan = OrphanedCascade {
            id: format!("orphan_{}", uuid_v7_without_dashes()),
            batch_id: job.batch_id.clone(),
            job_id: job.job_id(),
            entity_type: job.entity_type,
            entity_id: job.entity_id.clone(),
            level: job.level,
            pending_jobs,
            reason: reason.to_string(),
            recorded_at: now_ms(),
        };
        self.orphans.record(&orphan).await?;
        tracing::error!(
            batch_id = %orphan.batch_id,
            job_id = %orphan.job_id,
            orphan_id = %orphan.id,
            pending = orphan.pending_jobs.len(),
            reason,
            "orphaned cascade recorded"
        );
        Ok(orphan)
    }

    pub async fn list_orphans(&self) -> DomainResult<Vec<OrphanedCascade>> {
        Ok(self.orphans.list().await?)
    }

    /// Re-enqueues the pending jobs of every orphan; resolved records are
    /// removed from the ledger.
    pub async fn reconcile_orphans(&self) -> DomainResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for orphan in self.orphans.list().await? {
            match self.enqueue_level_jobs(&orphan.pending_jobs).await {
                Ok(inserted) => {
                    self.orphans.resolve(&orphan.id).await?;
                    report.reconciled += 1;
                    report.requeued_jobs += inserted as u64;
                    tracing::info!(
                        orphan_id = %orphan.id,
                        batch_id = %orphan.batch_id,
                        requeued = inserted,
                        "orphaned cascade reconciled"
                    );
                }
                Err(err) => {
                    tracing::warn!(orphan_id = %orphan.id, error = %err, "orphan reconcile failed");
                    report.failed.push(ItemError {
                        id: orphan.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    pub async fn promote_due(&self, limit: usize) -> DomainResult<usize> {
        let now = now_ms();
        let mut moved = 0;
        for queue in QueueName::ALL {
            moved += self.queue.promote_due(queue, now, limit).await?;
        }
        Ok(moved)
    }

    /// Returns jobs leased longer than `lease` to waiting. No attempt is
    /// consumed.
    pub async fn requeue_stale(&self, lease: Duration, limit: usize) -> DomainResult<usize> {
        let cutoff = now_ms() - lease.as_millis() as i64;
        let mut moved = 0;
        for queue in QueueName::ALL {
            moved += self.queue.requeue_stale_active(queue, cutoff, limit).await?;
        }
        if moved > 0 {
            tracing::warn!(moved, "stale active jobs re-queued");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::{InMemoryCascadeQueue, InMemoryDeadLetterStore, InMemoryOrphanLedger};

    fn service(attempts: u32) -> CascadeQueueService {
        CascadeQueueService::new(
            Arc::new(InMemoryCascadeQueue::new()),
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryOrphanLedger::new()),
            JobOptions {
                attempts,
                backoff_base_ms: 2_000,
                backoff_max_ms: 60_000,
            },
            2,
        )
    }

    #[tokio::test]
    async fn batch_job_is_keyed_by_batch_id_and_sorted() {
        let service = service(3);
        let batch_id = service
            .add_batch_cascade_job(
                vec![
                    EntityUpdate::new(EntityKind::Lesson, "l-1", Status::Archived),
                    EntityUpdate::new(EntityKind::Category, "c-1", Status::Archived),
                ],
                "u-1",
            )
            .await
            .expect("enqueue");
        assert!(batch_id.starts_with("batch_"));

        let record = service
            .next_job(QueueName::Batch, Duration::from_millis(5))
            .await
            .expect("dequeue")
            .expect("job");
        assert_eq!(record.job_id, batch_id);
        let CascadeJob::Batch(job) = record.payload else {
            panic!("expected batch job");
        };
        assert_eq!(job.updates[0].entity_type, EntityKind::Category);
    }

    #[tokio::test]
    async fn failure_backs_off_then_dead_letters() {
        let service = service(2);
        service
            .start_level_based_cascade(EntityKind::Course, "co-1", Status::Archived, "u-1")
            .await
            .expect("start");
        let record = service
            .next_job(QueueName::Level, Duration::from_millis(5))
            .await
            .expect("dequeue")
            .expect("job");

        let first = service
            .handle_failure(&record, "redis down", None)
            .await
            .expect("failure");
        assert_eq!(
            first,
            FailureOutcome::Retrying {
                delay_ms: 2_000,
                attempt: 1
            }
        );

        let mut retried = service
            .queue
            .get(QueueName::Level, &record.job_id)
            .await
            .expect("get")
            .expect("record");
        assert_eq!(retried.state, JobState::Delayed);
        retried.state = JobState::Active;

        let second = service
            .handle_failure(&retried, "redis down", None)
            .await
            .expect("failure");
        assert!(matches!(second, FailureOutcome::DeadLettered { .. }));
        let failed = service.list_failed_jobs().await.expect("failed");
        assert_eq!(failed.level_queue.len(), 1);
        assert_eq!(failed.dlq.len(), 1);
        assert_eq!(failed.dlq[0].retry_count, 2);
        assert_eq!(failed.dlq[0].original_job_id, record.job_id);
    }

    #[tokio::test]
    async fn cancel_removes_only_pending_jobs() {
        let service = service(3);
        let batch_id = service
            .start_level_based_cascade(EntityKind::Category, "c-1", Status::Archived, "u-1")
            .await
            .expect("start");
        let root = service
            .next_job(QueueName::Level, Duration::from_millis(5))
            .await
            .expect("dequeue")
            .expect("job");
        let CascadeJob::Level(level0) = &root.payload else {
            panic!("expected level job");
        };
        let children = vec![
            level0.child_job(EntityKind::Course, "co-1", Status::Archived),
            level0.child_job(EntityKind::Course, "co-2", Status::Archived),
            level0.child_job(EntityKind::Course, "co-3", Status::Archived),
        ];
        assert_eq!(service.enqueue_level_jobs(&children).await.expect("enqueue"), 3);

        let result = service.cancel_batch_cascade(&batch_id).await.expect("cancel");
        assert_eq!(
            result,
            CancelResult {
                cancelled: 3,
                already_completed: 0,
                already_active: 1
            }
        );
    }

    #[tokio::test]
    async fn progress_groups_level_jobs_and_reports_orphans() {
        let service = service(3);
        let batch_id = service
            .start_level_based_cascade(EntityKind::Category, "c-1", Status::Archived, "u-1")
            .await
            .expect("start");
        let root = service
            .next_job(QueueName::Level, Duration::from_millis(5))
            .await
            .expect("dequeue")
            .expect("job");
        service
            .complete(&root, serde_json::json!({"updatedCount": 1}))
            .await
            .expect("complete");
        let CascadeJob::Level(level0) = &root.payload else {
            panic!("expected level job");
        };
        let pending = vec![level0.child_job(EntityKind::Course, "co-1", Status::Archived)];
        service
            .record_orphan(level0, pending, "queue unavailable")
            .await
            .expect("orphan");

        let progress = service.get_batch_progress(&batch_id).await.expect("progress");
        assert_eq!(progress.level_jobs.total, 1);
        assert_eq!(progress.level_jobs.completed, 1);
        assert_eq!(progress.level_jobs.by_level[0].level, 0);
        assert_eq!(progress.orphaned.len(), 1);

        let report = service.reconcile_orphans().await.expect("reconcile");
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.requeued_jobs, 1);
        let progress = service.get_batch_progress(&batch_id).await.expect("progress");
        assert!(progress.orphaned.is_empty());
        assert_eq!(progress.level_jobs.waiting, 1);
    }

    #[tokio::test]
    async fn retry_failed_job_requires_failed_state() {
        let service = service(1);
        let batch_id = service
            .add_batch_cascade_job(
                vec![EntityUpdate::new(EntityKind::Lesson, "l-1", Status::Archived)],
                "u-1",
            )
            .await
            .expect("enqueue");
        let err = service
            .retry_failed_job(QueueName::Batch, &batch_id)
            .await
            .expect_err("waiting job");
        assert!(matches!(err, DomainError::Conflict(_)));

        let record = service
            .next_job(QueueName::Batch, Duration::from_millis(5))
            .await
            .expect("dequeue")
            .expect("job");
        service
            .handle_failure(&record, "boom", None)
            .await
            .expect("failure");
        service
            .retry_failed_job(QueueName::Batch, &batch_id)
            .await
            .expect("retry");
        let counts = service.get_queue_metrics().await.expect("metrics");
        assert_eq!(counts.batch_queue.waiting, 1);
        assert_eq!(counts.dead_letter_queue.total, 1);
    }

    #[tokio::test]
    async fn health_is_healthy_for_small_queues() {
        let health = service(3).health().await.expect("health");
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_jobs() {
        let service = service(3);
        let batch_id = service
            .add_batch_cascade_job(
                vec![EntityUpdate::new(EntityKind::Lesson, "l-1", Status::Archived)],
                "u-1",
            )
            .await
            .expect("enqueue");
        let record = service
            .next_job(QueueName::Batch, Duration::from_millis(5))
            .await
            .expect("dequeue")
            .expect("job");
        service
            .complete(&record, serde_json::json!({}))
            .await
            .expect("complete");

        let kept = service.cleanup_completed_jobs(1).await.expect("cleanup");
        assert_eq!(kept.total, 0);
        let kept = service.cleanup_completed_jobs(u64::MAX).await.expect("cleanup");
        assert_eq!(kept.total, 0);
        let kept = service.cleanup_failed_jobs(u64::MAX).await.expect("cleanup");
        assert_eq!(kept.total, 0);
        let stats = service.retention_stats().await.expect("stats");
        assert_eq!(stats.batch_queue.completed.total, 1);
        assert!(service.get_batch_progress(&batch_id).await.expect("progress").batch_job.is_some());
    }
}
