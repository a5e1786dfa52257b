use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use redis::Value;
use redis::aio::ConnectionManager;
use syllabus_domain::jobs::{DeadLetterEntry, OrphanedCascade, now_ms};
use syllabus_domain::ports::BoxFuture;
use syllabus_domain::ports::jobs::{
    CascadeQueue, DeadLetterStore, JobCounts, JobQueueError, JobRecord, JobState, OrphanLedger,
    QueueName,
};

pub const DEFAULT_PREFIX: &str = "syllabus:cascade";

/// Ready jobs are ordered by priority, then by the time they became ready.
const PRIORITY_STRIDE: f64 = 1e13;
const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn queue_error(err: redis::RedisError) -> JobQueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        JobQueueError::Unavailable(err.to_string())
    } else {
        JobQueueError::Operation(err.to_string())
    }
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<String, JobQueueError> {
    serde_json::to_string(value).map_err(|err| JobQueueError::Serialization(err.to_string()))
}

fn deserialize<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, JobQueueError> {
    serde_json::from_str(payload).map_err(|err| JobQueueError::Serialization(err.to_string()))
}

fn ready_score(priority: u32, now_ms: i64) -> f64 {
    priority as f64 * PRIORITY_STRIDE + now_ms as f64
}

struct QueueKeys {
    jobs: String,
    ready: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    batch_prefix: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: QueueName) -> Self {
        let base = format!("{prefix}:{queue}");
        Self {
            jobs: format!("{base}:jobs"),
            ready: format!("{base}:ready"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            batch_prefix: format!("{base}:batch"),
        }
    }

    fn batch(&self, batch_id: &str) -> String {
        format!("{}:{batch_id}", self.batch_prefix)
    }

    fn state_set(&self, state: JobState) -> &str {
        match state {
            JobState::Waiting => &self.ready,
            JobState::Delayed => &self.delayed,
            JobState::Active => &self.active,
            JobState::Completed => &self.completed,
            JobState::Failed => &self.failed,
        }
    }

    fn state_sets(&self) -> [&str; 5] {
        [
            &self.ready,
            &self.delayed,
            &self.active,
            &self.completed,
            &self.failed,
        ]
    }
}

/// Both cascade queues on Redis.
///
/// Records live in one hash per queue; the state of a job is the sorted set
/// that holds its id. Leasing moves an id from `ready` to `active` in one
/// script so a crashed worker leaves a reapable trace.
#[derive(Clone)]
pub struct RedisCascadeQueue {
    manager: ConnectionManager,
    batch: Arc<QueueKeys>,
    level: Arc<QueueKeys>,
}

impl RedisCascadeQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, JobQueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, JobQueueError> {
        let manager = connect_manager(redis_url).await?;
        Ok(Self::with_manager(manager, prefix))
    }

    pub fn with_manager(manager: ConnectionManager, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            manager,
            batch: Arc::new(QueueKeys::new(&prefix, QueueName::Batch)),
            level: Arc::new(QueueKeys::new(&prefix, QueueName::Level)),
        }
    }

    fn keys(&self, queue: QueueName) -> &QueueKeys {
        match queue {
            QueueName::Batch => &self.batch,
            QueueName::Level => &self.level,
        }
    }

    async fn insert(&self, record: &JobRecord) -> Result<bool, JobQueueError> {
        let keys = self.keys(record.queue);
        let payload = serialize(record)?;
        let now = now_ms();
        let script = redis::Script::new(
            r#"
                local jobs_key = KEYS[1]
                local ready_key = KEYS[2]
                local delayed_key = KEYS[3]
                local batch_key = KEYS[4]
                local job_id = ARGV[1]
                local payload = ARGV[2]
                local run_at_ms = tonumber(ARGV[3])
                local now_ms = tonumber(ARGV[4])
                local ready_score = ARGV[5]

                if redis.call('HSETNX', jobs_key, job_id, payload) == 0 then
                    return 0
                end
                if run_at_ms <= now_ms then
                    redis.call('ZADD', ready_key, ready_score, job_id)
                else
                    redis.call('ZADD', delayed_key, run_at_ms, job_id)
                end
                redis.call('SADD', batch_key, job_id)
                return 1
            "#,
        );
        let mut conn = self.manager.clone();
        let inserted: i32 = script
            .key(&keys.jobs)
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(keys.batch(&record.batch_id))
            .arg(&record.job_id)
            .arg(payload)
            .arg(record.run_at_ms)
            .arg(now)
            .arg(ready_score(record.priority, now))
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(inserted == 1)
    }

    async fn load(&self, queue: QueueName, job_id: &str) -> Result<Option<JobRecord>, JobQueueError> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn
            .hget(&self.keys(queue).jobs, job_id)
            .await
            .map_err(queue_error)?;
        payload.as_deref().map(deserialize).transpose()
    }

    async fn load_many(
        &self,
        queue: QueueName,
        job_ids: &[String],
    ) -> Result<Vec<JobRecord>, JobQueueError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys(queue).jobs)
            .arg(job_ids)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        payloads
            .into_iter()
            .flatten()
            .map(|payload| deserialize(&payload))
            .collect()
    }

    async fn store(&self, record: &JobRecord) -> Result<(), JobQueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .hset(&self.keys(record.queue).jobs, &record.job_id, serialize(record)?)
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    /// Writes `record` and moves its id from `from` to the set of its state.
    async fn transition(&self, record: &JobRecord, from: JobState, score: f64) -> Result<(), JobQueueError> {
        let keys = self.keys(record.queue);
        let mut conn = self.manager.clone();
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline
            .cmd("HSET")
            .arg(&keys.jobs)
            .arg(&record.job_id)
            .arg(serialize(record)?);
        pipeline
            .cmd("ZREM")
            .arg(keys.state_set(from))
            .arg(&record.job_id);
        pipeline
            .cmd("ZADD")
            .arg(keys.state_set(record.state))
            .arg(score)
            .arg(&record.job_id);
        let _: Vec<Value> = pipeline.query_async(&mut conn).await.map_err(queue_error)?;
        Ok(())
    }

    async fn try_lease(&self, queue: QueueName) -> Result<Option<JobRecord>, JobQueueError> {
        let keys = self.keys(queue);
        let script = redis::Script::new(
            r#"
                local popped = redis.call('ZPOPMIN', KEYS[1], 1)
                if #popped == 0 then
                    return false
                end
                redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
                return popped[1]
            "#,
        );
        loop {
            let now = now_ms();
            let mut conn = self.manager.clone();
            let leased: Option<String> = script
                .key(&keys.ready)
                .key(&keys.active)
                .arg(now)
                .invoke_async(&mut conn)
                .await
                .map_err(queue_error)?;
            let Some(job_id) = leased else {
                return Ok(None);
            };
            let Some(mut record) = self.load(queue, &job_id).await? else {
                let _: i64 = conn.zrem(&keys.active, &job_id).await.map_err(queue_error)?;
                tracing::warn!(queue = %queue, job_id, "dropped leased id without record");
                continue;
            };
            record.state = JobState::Active;
            record.started_at_ms = Some(now);
            self.store(&record).await?;
            return Ok(Some(record));
        }
    }

    /// Moves ids scored at or below `max_score` out of `from`, up to `limit`.
    async fn move_due(
        &self,
        queue: QueueName,
        from: JobState,
        max_score: i64,
        limit: usize,
    ) -> Result<usize, JobQueueError> {
        if limit == 0 {
            return Ok(0);
        }
        let keys = self.keys(queue);
        let mut conn = self.manager.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys.state_set(from))
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(limit as i64)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;

        let mut moved = 0usize;
        for job_id in due {
            // Only the caller whose ZREM wins moves the job.
            let removed: i64 = conn
                .zrem(keys.state_set(from), &job_id)
                .await
                .map_err(queue_error)?;
            if removed == 0 {
                continue;
            }
            let Some(mut record) = self.load(queue, &job_id).await? else {
                continue;
            };
            let now = now_ms();
            record.state = JobState::Waiting;
            record.started_at_ms = None;
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("HSET")
                .arg(&keys.jobs)
                .arg(&job_id)
                .arg(serialize(&record)?);
            pipeline
                .cmd("ZADD")
                .arg(&keys.ready)
                .arg(ready_score(record.priority, now))
                .arg(&job_id);
            let _: Vec<Value> = pipeline.query_async(&mut conn).await.map_err(queue_error)?;
            moved += 1;
        }
        Ok(moved)
    }
}

impl CascadeQueue for RedisCascadeQueue {
    fn add(&self, record: &JobRecord) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let record = record.clone();
        Box::pin(async move { self.insert(&record).await })
    }

    fn add_bulk(&self, records: &[JobRecord]) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        let records = records.to_vec();
        Box::pin(async move {
            let mut inserted = 0usize;
            for record in &records {
                if self.insert(record).await? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    fn dequeue(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobRecord>, JobQueueError>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(record) = self.try_lease(queue).await? {
                    return Ok(Some(record));
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(EMPTY_POLL_INTERVAL.min(deadline - now)).await;
            }
        })
    }

    fn get(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> BoxFuture<'_, Result<Option<JobRecord>, JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move { self.load(queue, &job_id).await })
    }

    fn update_progress(
        &self,
        queue: QueueName,
        job_id: &str,
        progress: u8,
    ) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut record = self
                .load(queue, &job_id)
                .await?
                .ok_or_else(|| JobQueueError::NotFound(job_id.clone()))?;
            record.progress = progress.min(100);
            self.store(&record).await
        })
    }

    fn complete(
        &self,
        queue: QueueName,
        job_id: &str,
        result: serde_json::Value,
        now_ms: i64,
    ) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut record = self
                .load(queue, &job_id)
                .await?
                .ok_or_else(|| JobQueueError::NotFound(job_id.clone()))?;
            record.state = JobState::Completed;
            record.progress = 100;
            record.finished_at_ms = Some(now_ms);
            record.result = Some(result);
            self.transition(&record, JobState::Active, now_ms as f64).await
        })
    }

    fn retry_later(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let mut record = record.clone();
        Box::pin(async move {
            record.state = JobState::Delayed;
            record.started_at_ms = None;
            let run_at = record.run_at_ms as f64;
            self.transition(&record, JobState::Active, run_at).await
        })
    }

    fn fail(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let mut record = record.clone();
        Box::pin(async move {
            record.state = JobState::Failed;
            let finished = record.finished_at_ms.unwrap_or_else(now_ms);
            record.finished_at_ms = Some(finished);
            self.transition(&record, JobState::Active, finished as f64).await
        })
    }

    fn remove(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let Some(record) = self.load(queue, &job_id).await? else {
                return Ok(false);
            };
            let keys = self.keys(queue);
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline.cmd("HDEL").arg(&keys.jobs).arg(&job_id);
            for set in keys.state_sets() {
                pipeline.cmd("ZREM").arg(set).arg(&job_id).ignore();
            }
            pipeline
                .cmd("SREM")
                .arg(keys.batch(&record.batch_id))
                .arg(&job_id)
                .ignore();
            let (deleted,): (i64,) = pipeline.query_async(&mut conn).await.map_err(queue_error)?;
            Ok(deleted == 1)
        })
    }

    fn list(
        &self,
        queue: QueueName,
        states: &[JobState],
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>> {
        let states = states.to_vec();
        Box::pin(async move {
            let keys = self.keys(queue);
            let mut conn = self.manager.clone();
            let mut ids: Vec<String> = Vec::new();
            for state in states {
                let mut members: Vec<String> = conn
                    .zrange(keys.state_set(state), 0, -1)
                    .await
                    .map_err(queue_error)?;
                ids.append(&mut members);
            }
            self.load_many(queue, &ids).await
        })
    }

    fn list_batch(
        &self,
        queue: QueueName,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>> {
        let batch_id = batch_id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let ids: Vec<String> = conn
                .smembers(self.keys(queue).batch(&batch_id))
                .await
                .map_err(queue_error)?;
            self.load_many(queue, &ids).await
        })
    }

    fn counts(&self, queue: QueueName) -> BoxFuture<'_, Result<JobCounts, JobQueueError>> {
        Box::pin(async move {
            let keys = self.keys(queue);
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            for set in keys.state_sets() {
                pipeline.cmd("ZCARD").arg(set);
            }
            let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
                pipeline.query_async(&mut conn).await.map_err(queue_error)?;
            Ok(JobCounts {
                waiting,
                active,
                completed,
                failed,
                delayed,
            })
        })
    }

    fn promote_due(
        &self,
        queue: QueueName,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move { self.move_due(queue, JobState::Delayed, now_ms, limit).await })
    }

    fn requeue_stale_active(
        &self,
        queue: QueueName,
        started_before_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            self.move_due(queue, JobState::Active, started_before_ms, limit)
                .await
        })
    }
}

/// Dead-lettered jobs, one hash field per entry.
#[derive(Clone)]
pub struct RedisDeadLetterStore {
    manager: ConnectionManager,
    key: String,
}

impl RedisDeadLetterStore {
    pub fn with_manager(manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            manager,
            key: format!("{prefix}:dlq"),
        }
    }
}

impl DeadLetterStore for RedisDeadLetterStore {
    fn push(&self, entry: &DeadLetterEntry) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let payload = serialize(entry);
        let id = entry.id.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn.hset(&self.key, id, payload?).await.map_err(queue_error)?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<DeadLetterEntry>, JobQueueError>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let payload: Option<String> = conn.hget(&self.key, id).await.map_err(queue_error)?;
            payload.as_deref().map(deserialize).transpose()
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<DeadLetterEntry>, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let payloads: Vec<String> = conn.hvals(&self.key).await.map_err(queue_error)?;
            payloads.iter().map(|payload| deserialize(payload)).collect()
        })
    }

    fn remove(&self, id: &str) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: i64 = conn.hdel(&self.key, id).await.map_err(queue_error)?;
            Ok(removed == 1)
        })
    }
}

#[derive(Clone)]
pub struct RedisOrphanLedger {
    manager: ConnectionManager,
    key: String,
}

impl RedisOrphanLedger {
    pub fn with_manager(manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            manager,
            key: format!("{prefix}:orphans"),
        }
    }
}

impl OrphanLedger for RedisOrphanLedger {
    fn record(&self, orphan: &OrphanedCascade) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let payload = serialize(orphan);
        let id = orphan.id.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn.hset(&self.key, id, payload?).await.map_err(queue_error)?;
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let payloads: Vec<String> = conn.hvals(&self.key).await.map_err(queue_error)?;
            let mut orphans = payloads
                .iter()
                .map(|payload| deserialize::<OrphanedCascade>(payload))
                .collect::<Result<Vec<_>, _>>()?;
            orphans.sort_by_key(|orphan| orphan.recorded_at);
            Ok(orphans)
        })
    }

    fn list_batch(
        &self,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>> {
        let batch_id = batch_id.to_string();
        Box::pin(async move {
            let orphans = self.list().await?;
            Ok(orphans
                .into_iter()
                .filter(|orphan| orphan.batch_id == batch_id)
                .collect())
        })
    }

    fn resolve(&self, id: &str) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: i64 = conn.hdel(&self.key, id).await.map_err(queue_error)?;
            Ok(removed == 1)
        })
    }
}

pub async fn connect_manager(redis_url: &str) -> Result<ConnectionManager, JobQueueError> {
    let client =
        redis::Client::open(redis_url).map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|err| JobQueueError::Unavailable(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_priority_always_sorts_first() {
        let far_future = 4_102_444_800_000; // 2100-01-01
        assert!(ready_score(0, far_future) < ready_score(1, 0));
        assert!(ready_score(1, 10) < ready_score(1, 11));
    }

    #[test]
    fn keys_are_namespaced_per_queue() {
        let keys = QueueKeys::new("syllabus:cascade", QueueName::Level);
        assert_eq!(keys.jobs, "syllabus:cascade:level:jobs");
        assert_eq!(keys.batch("batch_1"), "syllabus:cascade:level:batch:batch_1");
        assert_eq!(keys.state_set(JobState::Delayed), "syllabus:cascade:level:delayed");
    }
}
