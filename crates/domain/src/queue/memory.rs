use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::jobs::{DeadLetterEntry, OrphanedCascade, now_ms};
use crate::ports::BoxFuture;
use crate::ports::jobs::{
    CascadeQueue, DeadLetterStore, JobCounts, JobQueueError, JobRecord, JobState, OrphanLedger,
    QueueName,
};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, JobRecord>,
    /// Waiting jobs ordered by (priority, insertion sequence).
    ready: BTreeMap<(u32, u64), String>,
    seq: u64,
}

impl QueueState {
    fn push_ready(&mut self, record: &JobRecord) {
        self.seq += 1;
        self.ready
            .insert((record.priority, self.seq), record.job_id.clone());
    }

    fn unlink_ready(&mut self, job_id: &str) {
        self.ready.retain(|_, id| id != job_id);
    }

    fn store(&mut self, mut record: JobRecord, now: i64) {
        self.unlink_ready(&record.job_id);
        if record.state == JobState::Waiting && record.run_at_ms > now {
            record.state = JobState::Delayed;
        }
        if record.state == JobState::Waiting {
            self.push_ready(&record);
        }
        self.jobs.insert(record.job_id.clone(), record);
    }
}

#[derive(Default)]
struct Lanes {
    batch: QueueState,
    level: QueueState,
}

impl Lanes {
    fn lane(&mut self, queue: QueueName) -> &mut QueueState {
        match queue {
            QueueName::Batch => &mut self.batch,
            QueueName::Level => &mut self.level,
        }
    }
}

/// Both cascade queues in process memory. Dequeue blocks on a `Notify`
/// per queue instead of polling.
#[derive(Clone)]
pub struct InMemoryCascadeQueue {
    inner: Arc<Mutex<Lanes>>,
    batch_ready: Arc<Notify>,
    level_ready: Arc<Notify>,
}

impl Default for InMemoryCascadeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCascadeQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Lanes::default())),
            batch_ready: Arc::new(Notify::new()),
            level_ready: Arc::new(Notify::new()),
        }
    }

    fn notify(&self, queue: QueueName) -> &Arc<Notify> {
        match queue {
            QueueName::Batch => &self.batch_ready,
            QueueName::Level => &self.level_ready,
        }
    }

    fn try_lease(&self, queue: QueueName) -> Option<JobRecord> {
        let mut guard = self.inner.lock().expect("cascade queue lock");
        let lane = guard.lane(queue);
        let (_, job_id) = lane.ready.pop_first()?;
        let record = lane.jobs.get_mut(&job_id)?;
        record.state = JobState::Active;
        record.started_at_ms = Some(now_ms());
        Some(record.clone())
    }
}

impl CascadeQueue for InMemoryCascadeQueue {
    fn add(&self, record: &JobRecord) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let record = record.clone();
        Box::pin(async move {
            let queue = record.queue;
            let inserted = {
                let mut guard = self.inner.lock().expect("cascade queue lock");
                let lane = guard.lane(queue);
                if lane.jobs.contains_key(&record.job_id) {
                    false
                } else {
                    lane.store(record, now_ms());
                    true
                }
            };
            if inserted {
                self.notify(queue).notify_one();
            }
            Ok(inserted)
        })
    }

    fn add_bulk(&self, records: &[JobRecord]) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        let records = records.to_vec();
        Box::pin(async move {
            let mut inserted = 0usize;
            for record in records {
                if self.add(&record).await? {
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
            let deadline = Instant::now() + timeout;
            loop {
                let notified = self.notify(queue).notified();
                if let Some(record) = self.try_lease(queue) {
                    return Ok(Some(record));
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(self.try_lease(queue));
                }
            }
        })
    }

    fn get(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> BoxFuture<'_, Result<Option<JobRecord>, JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("cascade queue lock");
            Ok(guard.lane(queue).jobs.get(&job_id).cloned())
        })
    }

    fn update_progress(
        &self,
        queue: QueueName,
        job_id: &str,
        progress: u8,
    ) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("cascade queue lock");
            let record = guard
                .lane(queue)
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| JobQueueError::NotFound(job_id.clone()))?;
            record.progress = progress.min(100);
            Ok(())
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
            let mut guard = self.inner.lock().expect("cascade queue lock");
            let record = guard
                .lane(queue)
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| JobQueueError::NotFound(job_id.clone()))?;
            record.state = JobState::Completed;
            record.progress = 100;
            record.finished_at_ms = Some(now_ms);
            record.result = Some(result);
            Ok(())
        })
    }

    fn retry_later(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let mut record = record.clone();
        Box::pin(async move {
            let queue = record.queue;
            record.state = JobState::Waiting;
            record.started_at_ms = None;
            {
                let mut guard = self.inner.lock().expect("cascade queue lock");
                guard.lane(queue).store(record, now_ms());
            }
            self.notify(queue).notify_one();
            Ok(())
        })
    }

    fn fail(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let mut record = record.clone();
        Box::pin(async move {
            record.state = JobState::Failed;
            let mut guard = self.inner.lock().expect("cascade queue lock");
            guard.lane(record.queue).store(record, now_ms());
            Ok(())
        })
    }

    fn remove(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("cascade queue lock");
            let lane = guard.lane(queue);
            lane.unlink_ready(&job_id);
            Ok(lane.jobs.remove(&job_id).is_some())
        })
    }

    fn list(
        &self,
        queue: QueueName,
        states: &[JobState],
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>> {
        let states = states.to_vec();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("cascade queue lock");
            let mut out: Vec<JobRecord> = guard
                .lane(queue)
                .jobs
                .values()
                .filter(|record| states.contains(&record.state))
                .cloned()
                .collect();
            out.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            });
            Ok(out)
        })
    }

    fn list_batch(
        &self,
        queue: QueueName,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>> {
        let batch_id = batch_id.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("cascade queue lock");
            let mut out: Vec<JobRecord> = guard
                .lane(queue)
                .jobs
                .values()
                .filter(|record| record.batch_id == batch_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.job_id.cmp(&b.job_id));
            Ok(out)
        })
    }

    fn counts(&self, queue: QueueName) -> BoxFuture<'_, Result<JobCounts, JobQueueError>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("cascade queue lock");
            let mut counts = JobCounts::default();
            for record in guard.lane(queue).jobs.values() {
                match record.state {
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Delayed => counts.delayed += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
            Ok(counts)
        })
    }

    fn promote_due(
        &self,
        queue: QueueName,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let moved = {
                let mut guard = self.inner.lock().expect("cascade queue lock");
                let lane = guard.lane(queue);
                let mut due: Vec<(i64, String)> = lane
                    .jobs
                    .values()
                    .filter(|record| record.state == JobState::Delayed && record.run_at_ms <= now_ms)
                    .map(|record| (record.run_at_ms, record.job_id.clone()))
                    .collect();
                due.sort();
                due.truncate(limit);
                for (_, job_id) in &due {
                    if let Some(record) = lane.jobs.get_mut(job_id) {
                        record.state = JobState::Waiting;
                        let snapshot = record.clone();
                        lane.push_ready(&snapshot);
                    }
                }
                due.len()
            };
            if moved > 0 {
                self.notify(queue).notify_waiters();
            }
            Ok(moved)
        })
    }

    fn requeue_stale_active(
        &self,
        queue: QueueName,
        started_before_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let moved = {
                let mut guard = self.inner.lock().expect("cascade queue lock");
                let lane = guard.lane(queue);
                let stale: Vec<String> = lane
                    .jobs
                    .values()
                    .filter(|record| {
                        record.state == JobState::Active
                            && record
                                .started_at_ms
                                .is_some_and(|started| started < started_before_ms)
                    })
                    .map(|record| record.job_id.clone())
                    .take(limit)
                    .collect();
                for job_id in &stale {
                    if let Some(record) = lane.jobs.get_mut(job_id) {
                        record.state = JobState::Waiting;
                        record.started_at_ms = None;
                        let snapshot = record.clone();
                        lane.push_ready(&snapshot);
                    }
                }
                stale.len()
            };
            if moved > 0 {
                self.notify(queue).notify_waiters();
            }
            Ok(moved)
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    inner: Arc<Mutex<HashMap<String, DeadLetterEntry>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn push(&self, entry: &DeadLetterEntry) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let entry = entry.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("dead letter store lock");
            guard.insert(entry.id.clone(), entry);
            Ok(())
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<DeadLetterEntry>, JobQueueError>> {
        let id = id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.lock().expect("dead letter store lock");
            Ok(guard.get(&id).cloned())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<DeadLetterEntry>, JobQueueError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.lock().expect("dead letter store lock");
            let mut entries: Vec<DeadLetterEntry> = guard.values().cloned().collect();
            entries.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
            Ok(entries)
        })
    }

    fn remove(&self, id: &str) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let id = id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("dead letter store lock");
            Ok(guard.remove(&id).is_some())
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOrphanLedger {
    inner: Arc<Mutex<BTreeMap<String, OrphanedCascade>>>,
}

impl InMemoryOrphanLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrphanLedger for InMemoryOrphanLedger {
    fn record(&self, orphan: &OrphanedCascade) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let orphan = orphan.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("orphan ledger lock");
            guard.insert(orphan.id.clone(), orphan);
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.lock().expect("orphan ledger lock");
            Ok(guard.values().cloned().collect())
        })
    }

    fn list_batch(
        &self,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>> {
        let batch_id = batch_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.lock().expect("orphan ledger lock");
            Ok(guard
                .values()
                .filter(|orphan| orphan.batch_id == batch_id)
                .cloned()
                .collect())
        })
    }

    fn resolve(&self, id: &str) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let id = id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("orphan ledger lock");
            Ok(guard.remove(&id).is_some())
        })
    }
}
