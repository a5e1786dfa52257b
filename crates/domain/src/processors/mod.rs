//! Queue consumers. One dequeued job is one `run_once` call; the binary owns
//! the loop around it.

pub mod batch;
pub mod level;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

pub use batch::{BatchCascadeProcessor, BatchCascadeResult, SingleCascadeResult};
pub use level::{LevelCascadeProcessor, LevelCascadeResult};

use crate::DomainResult;
use crate::error::DomainError;
use crate::jobs::CascadeJob;
use crate::lock::LockProvider;
use crate::ports::jobs::QueueName;
use crate::ports::store::HierarchyStore;
use crate::queue::{CascadeQueueService, FailureOutcome};

/// A processor's verdict on a failed job. `result` keeps diagnostics that
/// should survive the failure.
#[derive(Debug)]
pub struct JobFailure {
    pub reason: String,
    pub result: Option<serde_json::Value>,
}

impl JobFailure {
    pub fn with_result(reason: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            reason: reason.into(),
            result: Some(result),
        }
    }
}

impl From<DomainError> for JobFailure {
    fn from(err: DomainError) -> Self {
        Self {
            reason: err.to_string(),
            result: None,
        }
    }
}

pub type ProcessResult = Result<serde_json::Value, JobFailure>;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Completed,
    Retrying,
    DeadLettered,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessedJob {
    pub job_id: String,
    pub queue: QueueName,
    pub disposition: Disposition,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct CascadeWorker {
    queue: CascadeQueueService,
    batch: BatchCascadeProcessor,
    level: LevelCascadeProcessor,
}

impl CascadeWorker {
    pub fn new(
        store: Arc<dyn HierarchyStore>,
        locks: Arc<LockProvider>,
        queue: CascadeQueueService,
    ) -> Self {
        Self {
            batch: BatchCascadeProcessor::new(store.clone(), locks.clone(), queue.clone()),
            level: LevelCascadeProcessor::new(store, locks, queue.clone()),
            queue,
        }
    }

    /// Leases and processes at most one job from `queue`.
    pub async fn run_once(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> DomainResult<Option<ProcessedJob>> {
        let Some(record) = self.queue.next_job(queue, timeout).await? else {
            return Ok(None);
        };
        let started = Instant::now();

        let outcome = match &record.payload {
            CascadeJob::Batch(job) => self.batch.process(&record, job).await,
            CascadeJob::Level(job) => self.level.process(&record, job).await,
        };

        let disposition = match outcome {
            Ok(result) => {
                self.queue.complete(&record, result).await?;
                Disposition::Completed
            }
            Err(failure) => {
                match self
                    .queue
                    .handle_failure(&record, &failure.reason, failure.result)
                    .await?
                {
                    FailureOutcome::Retrying { .. } => Disposition::Retrying,
                    FailureOutcome::DeadLettered { .. } => Disposition::DeadLettered,
                }
            }
        };

        let elapsed = started.elapsed();
        tracing::debug!(
            queue = %queue,
            job_id = %record.job_id,
            disposition = disposition.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "cascade job processed"
        );
        Ok(Some(ProcessedJob {
            job_id: record.job_id,
            queue,
            disposition,
            elapsed,
        }))
    }

    /// Processes jobs until both queues are empty. Delayed retries are not
    /// waited for.
    pub async fn drain(&self, max_jobs: usize) -> DomainResult<Vec<ProcessedJob>> {
        let mut processed = Vec::new();
        while processed.len() < max_jobs {
            let mut progressed = false;
            for queue in QueueName::ALL {
                if let Some(job) = self.run_once(queue, Duration::ZERO).await? {
                    processed.push(job);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(processed)
    }
}
