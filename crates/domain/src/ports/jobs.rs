use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BoxFuture;
use crate::jobs::{CascadeJob, DeadLetterEntry, OrphanedCascade};

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),
    #[error("job queue serialization error: {0}")]
    Serialization(String),
    #[error("job queue operation failed: {0}")]
    Operation(String),
    #[error("job {0} not found")]
    NotFound(String),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Batch,
    Level,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Batch, QueueName::Level];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Level => "level",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "batch" => Ok(Self::Batch),
            "level" => Ok(Self::Level),
            _ => Err("unknown queue"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }
}

/// A job as tracked by the queue, wrapping the wire payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub queue: QueueName,
    pub batch_id: String,
    pub payload: CascadeJob,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub priority: u32,
    pub progress: u8,
    pub run_at_ms: i64,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub failure_reason: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Timestamp used by retention: when the job reached its terminal state.
    pub fn finished_or_created_ms(&self) -> i64 {
        self.finished_at_ms.unwrap_or(self.created_at_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// Storage for the batch and level queues.
///
/// Job ids are unique per queue; `add` of an existing id is a no-op that
/// returns `false`.
pub trait CascadeQueue: Send + Sync {
    fn add(&self, record: &JobRecord) -> BoxFuture<'_, Result<bool, JobQueueError>>;
    fn add_bulk(&self, records: &[JobRecord]) -> BoxFuture<'_, Result<usize, JobQueueError>>;

    /// Leases the next waiting job, marking it active. Waits up to `timeout`.
    fn dequeue(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobRecord>, JobQueueError>>;

    fn get(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> BoxFuture<'_, Result<Option<JobRecord>, JobQueueError>>;

    fn update_progress(
        &self,
        queue: QueueName,
        job_id: &str,
        progress: u8,
    ) -> BoxFuture<'_, Result<(), JobQueueError>>;

    fn complete(
        &self,
        queue: QueueName,
        job_id: &str,
        result: serde_json::Value,
        now_ms: i64,
    ) -> BoxFuture<'_, Result<(), JobQueueError>>;

    /// Stores the updated record as delayed until `record.run_at_ms`.
    fn retry_later(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>>;

    /// Stores the updated record as failed.
    fn fail(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>>;

    fn remove(&self, queue: QueueName, job_id: &str)
    -> BoxFuture<'_, Result<bool, JobQueueError>>;

    fn list(
        &self,
        queue: QueueName,
        states: &[JobState],
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>>;

    fn list_batch(
        &self,
        queue: QueueName,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>>;

    fn counts(&self, queue: QueueName) -> BoxFuture<'_, Result<JobCounts, JobQueueError>>;

    fn promote_due(
        &self,
        queue: QueueName,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>>;

    /// Returns active jobs leased before `started_before_ms` to waiting.
    fn requeue_stale_active(
        &self,
        queue: QueueName,
        started_before_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>>;
}

pub trait DeadLetterStore: Send + Sync {
    fn push(&self, entry: &DeadLetterEntry) -> BoxFuture<'_, Result<(), JobQueueError>>;
    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<DeadLetterEntry>, JobQueueError>>;
    fn list(&self) -> BoxFuture<'_, Result<Vec<DeadLetterEntry>, JobQueueError>>;
    fn remove(&self, id: &str) -> BoxFuture<'_, Result<bool, JobQueueError>>;
}

/// Ledger of committed levels whose follow-on jobs could not be enqueued.
pub trait OrphanLedger: Send + Sync {
    fn record(&self, orphan: &OrphanedCascade) -> BoxFuture<'_, Result<(), JobQueueError>>;
    fn list(&self) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>>;
    fn list_batch(
        &self,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>>;
    fn resolve(&self, id: &str) -> BoxFuture<'_, Result<bool, JobQueueError>>;
}
