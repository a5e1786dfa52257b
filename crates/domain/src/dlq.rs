use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::hierarchy::EntityKind;
use crate::jobs::{
    CascadeJob, DAY_MS, DeadLetterEntry, EntityUpdate, cutoff_ms, new_batch_id, now_ms,
    sort_updates_by_order,
};
use crate::ports::jobs::DeadLetterStore;
use crate::queue::{CascadeQueueService, ItemError};
use crate::status::Status;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const DEFAULT_PURGE_DAYS: u64 = 30;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DlqJobType {
    Batch,
    Level,
    #[default]
    All,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DlqSortBy {
    #[default]
    FailedAt,
    RetryCount,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DlqQuery {
    pub job_type: DlqJobType,
    pub sort_by: DlqSortBy,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: usize,
}

impl Default for DlqQuery {
    fn default() -> Self {
        Self {
            job_type: DlqJobType::All,
            sort_by: DlqSortBy::FailedAt,
            order: SortOrder::Asc,
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "jobType", rename_all = "lowercase")]
pub enum DlqJobDetails {
    #[serde(rename_all = "camelCase")]
    Batch {
        updates: Vec<EntityUpdate>,
        entities_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    Level {
        level: u32,
        entity_type: EntityKind,
        entity_id: String,
        new_status: Status,
        parent_job_id: String,
    },
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DlqJobView {
    pub id: String,
    pub original_job_id: String,
    pub batch_id: String,
    pub failure_reason: String,
    pub retry_count: u32,
    pub triggered_at: i64,
    pub failed_at: i64,
    #[serde(flatten)]
    pub details: DlqJobDetails,
}

impl From<&DeadLetterEntry> for DlqJobView {
    fn from(entry: &DeadLetterEntry) -> Self {
        let details = match &entry.job {
            CascadeJob::Batch(job) => DlqJobDetails::Batch {
                updates: job.updates.clone(),
                entities_count: job.updates.len(),
            },
            CascadeJob::Level(job) => DlqJobDetails::Level {
                level: job.level,
                entity_type: job.entity_type,
                entity_id: job.entity_id.clone(),
                new_status: job.new_status,
                parent_job_id: job.parent_job_id.clone(),
            },
        };
        Self {
            id: entry.id.clone(),
            original_job_id: entry.original_job_id.clone(),
            batch_id: entry.job.batch_id().to_string(),
            failure_reason: entry.failure_reason.clone(),
            retry_count: entry.retry_count,
            triggered_at: entry.job.triggered_at(),
            failed_at: entry.failed_at,
            details,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DlqPage {
    pub jobs: Vec<DlqJobView>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct RetryCountBucket {
    pub retries: u32,
    pub count: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DlqStats {
    pub total: u64,
    pub by_retry_count: Vec<RetryCountBucket>,
    pub oldest_job: Option<i64>,
    pub newest_job: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct BulkRetryResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<ItemError>,
}

/// Operator workflow over dead-lettered cascade jobs.
#[derive(Clone)]
pub struct DeadLetterService {
    queue: CascadeQueueService,
    store: Arc<dyn DeadLetterStore>,
}

impl DeadLetterService {
    pub fn new(queue: CascadeQueueService) -> Self {
        let store = queue.dead_letters().clone();
        Self { queue, store }
    }

    pub async fn list(&self, query: DlqQuery) -> DomainResult<DlqPage> {
        let mut entries: Vec<DeadLetterEntry> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|entry| match (query.job_type, &entry.job) {
                (DlqJobType::All, _) => true,
                (DlqJobType::Batch, CascadeJob::Batch(_)) => true,
                (DlqJobType::Level, CascadeJob::Level(_)) => true,
                _ => false,
            })
            .collect();

        entries.sort_by(|a, b| {
            let ordering = match query.sort_by {
                DlqSortBy::FailedAt => a.failed_at.cmp(&b.failed_at),
                DlqSortBy::RetryCount => a.retry_count.cmp(&b.retry_count),
            };
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = entries.len();
        let jobs = entries
            .iter()
            .skip(query.offset)
            .take(query.limit)
            .map(DlqJobView::from)
            .collect();
        Ok(DlqPage {
            jobs,
            total,
            offset: query.offset,
            limit: query.limit,
        })
    }

    /// Re-enqueues the entry as a fresh job and drops it from the store.
    /// Returns the new batch id (batch jobs) or job id (level jobs).
    pub async fn retry(&self, id: &str) -> DomainResult<String> {
        let entry = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("DLQ job {id}")))?;

        let new_id = match entry.job.clone() {
            CascadeJob::Batch(mut job) => {
                job.batch_id = new_batch_id();
                job.retry_count = 0;
                job.failure_reason = None;
                job.triggered_at = now_ms();
                sort_updates_by_order(&mut job.updates);
                self.queue.enqueue_batch_job(job).await?
            }
            CascadeJob::Level(mut job) => {
                job.retry_count = 0;
                let job_id = format!("{}-retry-{}", job.job_id(), entry.id);
                self.queue.enqueue_level_job_as(job, job_id).await?
            }
        };
        self.store.remove(&entry.id).await?;
        tracing::info!(
            dlq_id = %entry.id,
            original_job_id = %entry.original_job_id,
            new_job_id = %new_id,
            "dead-lettered job retried"
        );
        Ok(new_id)
    }

    pub async fn bulk_retry(&self, ids: &[String]) -> DomainResult<BulkRetryResult> {
        let mut result = BulkRetryResult::default();
        for id in ids {
            match self.retry(id).await {
                Ok(new_id) => result.succeeded.push(new_id),
                Err(err) => result.failed.push(ItemError {
                    id: id.clone(),
                    error: err.to_string(),
                }),
            }
        }
        Ok(result)
    }

    pub async fn purge_older_than(&self, days: u64) -> DomainResult<u64> {
        let cutoff = cutoff_ms(now_ms(), days, DAY_MS);
        let removed = self.queue.purge_dead_letters_before(cutoff).await?;
        tracing::info!(removed, older_than_days = days, "dead letters purged");
        Ok(removed)
    }

    pub async fn stats(&self) -> DomainResult<DlqStats> {
        let entries = self.store.list().await?;
        let mut by_retry: BTreeMap<u32, u64> = BTreeMap::new();
        for entry in &entries {
            *by_retry.entry(entry.retry_count).or_default() += 1;
        }
        Ok(DlqStats {
            total: entries.len() as u64,
            by_retry_count: by_retry
                .into_iter()
                .map(|(retries, count)| RetryCountBucket { retries, count })
                .collect(),
            oldest_job: entries.iter().map(|entry| entry.failed_at).min(),
            newest_job: entries.iter().map(|entry| entry.failed_at).max(),
        })
    }
}
