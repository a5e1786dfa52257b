use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hierarchy::EntityKind;
use crate::ports::jobs::{JobRecord, JobState, QueueName};
use crate::status::Status;
use crate::util::uuid_v7_without_dashes;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub new_status: Status,
}

impl EntityUpdate {
    pub fn new(entity_type: EntityKind, entity_id: impl Into<String>, new_status: Status) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            new_status,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeBatchJob {
    pub batch_id: String,
    pub updates: Vec<EntityUpdate>,
    pub user_id: String,
    pub triggered_at: i64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeMetadata {
    pub total_levels: u32,
    pub current_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeLevelJob {
    pub batch_id: String,
    pub parent_job_id: String,
    pub level: u32,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub new_status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_status: Option<Status>,
    pub user_id: String,
    pub metadata: CascadeMetadata,
    pub triggered_at: i64,
    pub retry_count: u32,
}

impl CascadeLevelJob {
    pub fn job_id(&self) -> String {
        level_job_id(&self.batch_id, self.level, self.entity_type, &self.entity_id)
    }

    /// Follow-on job for a corrected child one level down.
    pub fn child_job(&self, child_kind: EntityKind, child_id: &str, target: Status) -> Self {
        Self {
            batch_id: self.batch_id.clone(),
            parent_job_id: self.job_id(),
            level: self.level + 1,
            entity_type: child_kind,
            entity_id: child_id.to_string(),
            new_status: target,
            parent_status: Some(self.new_status),
            user_id: self.user_id.clone(),
            metadata: CascadeMetadata {
                total_levels: self.metadata.total_levels,
                current_path: format!(
                    "{} > {}-{}",
                    self.metadata.current_path, child_kind, child_id
                ),
            },
            triggered_at: self.triggered_at,
            retry_count: 0,
        }
    }
}

/// Wire payload of either queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "jobType", rename_all = "lowercase")]
pub enum CascadeJob {
    Batch(CascadeBatchJob),
    Level(CascadeLevelJob),
}

impl CascadeJob {
    pub fn batch_id(&self) -> &str {
        match self {
            Self::Batch(job) => &job.batch_id,
            Self::Level(job) => &job.batch_id,
        }
    }

    pub fn queue(&self) -> QueueName {
        match self {
            Self::Batch(_) => QueueName::Batch,
            Self::Level(_) => QueueName::Level,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Batch(job) => job.retry_count,
            Self::Level(job) => job.retry_count,
        }
    }

    pub fn set_retry_count(&mut self, retry_count: u32) {
        match self {
            Self::Batch(job) => job.retry_count = retry_count,
            Self::Level(job) => job.retry_count = retry_count,
        }
    }

    pub fn triggered_at(&self) -> i64 {
        match self {
            Self::Batch(job) => job.triggered_at,
            Self::Level(job) => job.triggered_at,
        }
    }
}

/// A job that exhausted its attempts. Terminal until retried or purged.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: String,
    pub original_job_id: String,
    pub job: CascadeJob,
    pub failure_reason: String,
    pub failed_at: i64,
    pub retry_count: u32,
}

/// A level that committed but could not enqueue its follow-on jobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedCascade {
    pub id: String,
    pub batch_id: String,
    pub job_id: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub level: u32,
    pub pending_jobs: Vec<CascadeLevelJob>,
    pub reason: String,
    pub recorded_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub const HOUR_MS: i64 = 60 * 60 * 1_000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// `now - window * unit_ms`, saturating. An oversized window yields a cutoff
/// far in the past, so nothing is old enough to match.
pub fn cutoff_ms(now: i64, window: u64, unit_ms: i64) -> i64 {
    let span = i64::try_from(window)
        .unwrap_or(i64::MAX)
        .saturating_mul(unit_ms);
    now.saturating_sub(span)
}

pub fn backoff_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(pow);
    delay.min(max_ms)
}

pub fn new_batch_id() -> String {
    format!("batch_{}", uuid_v7_without_dashes())
}

pub fn level_job_id(batch_id: &str, level: u32, kind: EntityKind, entity_id: &str) -> String {
    format!("{batch_id}-L{level}-{kind}-{entity_id}")
}

/// Ancestors before descendants; stable for equal kinds.
pub fn sort_updates_by_order(updates: &mut [EntityUpdate]) {
    updates.sort_by_key(|update| update.entity_type.order());
}

pub fn new_job_record(
    job_id: String,
    payload: CascadeJob,
    options: JobOptions,
    priority: u32,
) -> JobRecord {
    let now = now_ms();
    JobRecord {
        job_id,
        queue: payload.queue(),
        batch_id: payload.batch_id().to_string(),
        payload,
        state: JobState::Waiting,
        attempts_made: 0,
        max_attempts: options.attempts.max(1),
        priority,
        progress: 0,
        run_at_ms: now,
        created_at_ms: now,
        started_at_ms: None,
        finished_at_ms: None,
        failure_reason: None,
        result: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cutoff_saturates_for_huge_windows() {
        assert_eq!(cutoff_ms(10 * DAY_MS, 3, DAY_MS), 7 * DAY_MS);
        assert_eq!(cutoff_ms(1_000, u64::MAX, DAY_MS), i64::MIN);
        assert_eq!(cutoff_ms(1_000, i64::MAX as u64 / 2, HOUR_MS), i64::MIN);
    }

    #[test]
    fn backoff_ms_returns_zero_for_zero_attempt() {
        assert_eq!(backoff_ms(2_000, 0, 60_000), 0);
    }

    #[test]
    fn backoff_ms_doubles_per_attempt_until_cap() {
        assert_eq!(backoff_ms(2_000, 1, 60_000), 2_000);
        assert_eq!(backoff_ms(2_000, 2, 60_000), 4_000);
        assert_eq!(backoff_ms(2_000, 3, 60_000), 8_000);
        assert_eq!(backoff_ms(2_000, 10, 5_000), 5_000);
    }

    #[test]
    fn level_job_id_is_stable_identity() {
        assert_eq!(
            level_job_id("batch_1", 2, EntityKind::Chapter, "ch-9"),
            "batch_1-L2-chapter-ch-9"
        );
    }

    #[test]
    fn level_job_uses_camel_case_wire_format() {
        let job = CascadeJob::Level(CascadeLevelJob {
            batch_id: "batch_1".into(),
            parent_job_id: "batch_1".into(),
            level: 0,
            entity_type: EntityKind::Course,
            entity_id: "c-1".into(),
            new_status: Status::Archived,
            parent_status: None,
            user_id: "u-1".into(),
            metadata: CascadeMetadata {
                total_levels: 2,
                current_path: "course-c-1".into(),
            },
            triggered_at: 10,
            retry_count: 0,
        });
        let value = serde_json::to_value(&job).expect("serialize");
        assert_eq!(value["jobType"], json!("level"));
        assert_eq!(value["batchId"], json!("batch_1"));
        assert_eq!(value["entityType"], json!("course"));
        assert_eq!(value["newStatus"], json!("archived"));
        assert_eq!(value["metadata"]["totalLevels"], json!(2));
        assert!(value.get("parentStatus").is_none());

        let decoded: CascadeJob = serde_json::from_value(value).expect("deserialize");
        assert_eq!(decoded, job);
    }

    #[test]
    fn child_job_extends_path_and_carries_applied_status() {
        let parent = CascadeLevelJob {
            batch_id: "batch_1".into(),
            parent_job_id: "batch_1".into(),
            level: 0,
            entity_type: EntityKind::Category,
            entity_id: "cat-1".into(),
            new_status: Status::Inactive,
            parent_status: None,
            user_id: "u-1".into(),
            metadata: CascadeMetadata {
                total_levels: 3,
                current_path: "category-cat-1".into(),
            },
            triggered_at: 10,
            retry_count: 2,
        };
        let child = parent.child_job(EntityKind::Course, "co-1", Status::Archived);
        assert_eq!(child.level, 1);
        assert_eq!(child.parent_job_id, "batch_1-L0-category-cat-1");
        assert_eq!(child.parent_status, Some(Status::Inactive));
        assert_eq!(child.new_status, Status::Archived);
        assert_eq!(child.metadata.current_path, "category-cat-1 > course-co-1");
        assert_eq!(child.retry_count, 0);
    }

    #[test]
    fn updates_sort_ancestors_first() {
        let mut updates = vec![
            EntityUpdate::new(EntityKind::Lesson, "l", Status::Archived),
            EntityUpdate::new(EntityKind::Category, "c", Status::Archived),
            EntityUpdate::new(EntityKind::Chapter, "h", Status::Archived),
        ];
        sort_updates_by_order(&mut updates);
        let kinds: Vec<_> = updates.iter().map(|u| u.entity_type).collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Category, EntityKind::Chapter, EntityKind::Lesson]
        );
    }
}
