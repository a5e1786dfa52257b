//! Entry point for cascades: picks a strategy and reports on its progress.

use serde::Serialize;

use crate::DomainResult;
use crate::error::DomainError;
use crate::hierarchy::EntityKind;
use crate::jobs::{CascadeJob, EntityUpdate, OrphanedCascade};
use crate::ports::jobs::JobState;
use crate::queue::{CancelResult, CascadeQueueService, LevelProgress, QueueMetrics};
use crate::status::Status;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum CascadeApproach {
    #[serde(rename = "level-by-level")]
    LevelByLevel,
    #[serde(rename = "batch")]
    Batch,
}

impl CascadeApproach {
    /// Level strategy for subtrees deeper than one level.
    pub fn for_kind(kind: EntityKind) -> Self {
        if kind.max_cascade_levels() > 1 {
            Self::LevelByLevel
        } else {
            Self::Batch
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LevelByLevel => "level-by-level",
            Self::Batch => "batch",
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeStarted {
    pub batch_id: String,
    pub approach: CascadeApproach,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BulkCascadeStarted {
    pub batch_id: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeProgress {
    pub batch_id: String,
    pub is_done: bool,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub active: u64,
    pub waiting: u64,
    pub percentage: u8,
    pub levels: Vec<LevelProgress>,
    pub orphaned: Vec<OrphanedCascade>,
}

#[derive(Clone)]
pub struct CascadeOrchestrator {
    queue: CascadeQueueService,
}

impl CascadeOrchestrator {
    pub fn new(queue: CascadeQueueService) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &CascadeQueueService {
        &self.queue
    }

    pub async fn start_cascade(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        new_status: Status,
        user_id: &str,
    ) -> DomainResult<CascadeStarted> {
        if entity_id.trim().is_empty() {
            return Err(DomainError::Validation("entityId must not be empty".into()));
        }
        let approach = CascadeApproach::for_kind(entity_type);
        let batch_id = match approach {
            CascadeApproach::LevelByLevel => {
                self.queue
                    .start_level_based_cascade(entity_type, entity_id, new_status, user_id)
                    .await?
            }
            CascadeApproach::Batch => {
                self.queue
                    .add_batch_cascade_job(
                        vec![EntityUpdate::new(entity_type, entity_id, new_status)],
                        user_id,
                    )
                    .await?
            }
        };
        tracing::info!(
            batch_id = %batch_id,
            approach = approach.as_str(),
            entity_type = %entity_type,
            entity_id,
            "cascade started"
        );
        Ok(CascadeStarted { batch_id, approach })
    }

    /// Multiple roots always go through one batch job.
    pub async fn start_bulk_cascade(
        &self,
        updates: Vec<EntityUpdate>,
        user_id: &str,
    ) -> DomainResult<BulkCascadeStarted> {
        if updates.is_empty() {
            return Err(DomainError::Validation("updates must not be empty".into()));
        }
        let batch_id = self.queue.add_batch_cascade_job(updates, user_id).await?;
        Ok(BulkCascadeStarted { batch_id })
    }

    /// Aggregates the batch job and every level job of `batch_id`.
    ///
    /// A batch is done only when it has jobs, none of them is pending and no
    /// orphaned level is waiting for reconciliation.
    pub async fn get_progress(&self, batch_id: &str) -> DomainResult<CascadeProgress> {
        let raw = self.queue.get_batch_progress(batch_id).await?;
        let mut total = raw.level_jobs.total;
        let mut completed = raw.level_jobs.completed;
        let mut failed = raw.level_jobs.failed;
        let mut active = raw.level_jobs.active;
        let mut waiting = raw.level_jobs.waiting;

        if let Some(batch) = &raw.batch_job {
            total += 1;
            match batch.state {
                JobState::Completed => completed += 1,
                JobState::Failed => failed += 1,
                JobState::Active => active += 1,
                JobState::Waiting | JobState::Delayed => waiting += 1,
            }
        }

        if total == 0 && raw.orphaned.is_empty() {
            return Err(DomainError::NotFound(format!("cascade {batch_id}")));
        }

        let is_done = total > 0
            && active == 0
            && waiting == 0
            && completed + failed == total
            && raw.orphaned.is_empty();
        let percentage = if total > 0 {
            ((completed + failed) as f64 / total as f64 * 100.0).round() as u8
        } else {
            0
        };

        Ok(CascadeProgress {
            batch_id: raw.batch_id,
            is_done,
            total,
            completed,
            failed,
            active,
            waiting,
            percentage,
            levels: raw.level_jobs.by_level,
            orphaned: raw.orphaned,
        })
    }

    pub async fn cancel_cascade(&self, batch_id: &str) -> DomainResult<CancelResult> {
        self.queue.cancel_batch_cascade(batch_id).await
    }

    pub async fn get_queue_metrics(&self) -> DomainResult<QueueMetrics> {
        self.queue.get_queue_metrics().await
    }

    /// Which strategy a queued job belongs to.
    pub fn approach_of(job: &CascadeJob) -> CascadeApproach {
        match job {
            CascadeJob::Batch(_) => CascadeApproach::Batch,
            CascadeJob::Level(_) => CascadeApproach::LevelByLevel,
        }
    }
}
