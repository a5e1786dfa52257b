use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use syllabus_domain::circuit_breaker::CircuitBreakerConfig;
use syllabus_domain::dlq::{DeadLetterService, DlqQuery};
use syllabus_domain::hierarchy::{EntityKind, EntityRecord};
use syllabus_domain::jobs::{EntityUpdate, JobOptions, OrphanedCascade};
use syllabus_domain::lock::{InMemoryLockBackend, LockProvider, LockSettings};
use syllabus_domain::orchestrator::{CascadeApproach, CascadeOrchestrator};
use syllabus_domain::ports::BoxFuture;
use syllabus_domain::ports::jobs::{
    CascadeQueue, JobCounts, JobQueueError, JobRecord, JobState, OrphanLedger, QueueName,
};
use syllabus_domain::processors::{CascadeWorker, Disposition};
use syllabus_domain::queue::CascadeQueueService;
use syllabus_domain::queue::memory::{
    InMemoryCascadeQueue, InMemoryDeadLetterStore, InMemoryOrphanLedger,
};
use syllabus_domain::status::Status;
use syllabus_domain::store::InMemoryHierarchyStore;

/// Delegates to the in-memory queue; bulk inserts fail while `broken` is set.
struct FlakyQueue {
    inner: InMemoryCascadeQueue,
    broken: AtomicBool,
}

impl CascadeQueue for FlakyQueue {
    fn add(&self, record: &JobRecord) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        self.inner.add(record)
    }

    fn add_bulk(&self, records: &[JobRecord]) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        if self.broken.load(Ordering::SeqCst) {
            return Box::pin(async { Err(JobQueueError::Unavailable("broker down".into())) });
        }
        self.inner.add_bulk(records)
    }

    fn dequeue(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobRecord>, JobQueueError>> {
        self.inner.dequeue(queue, timeout)
    }

    fn get(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> BoxFuture<'_, Result<Option<JobRecord>, JobQueueError>> {
        self.inner.get(queue, job_id)
    }

    fn update_progress(
        &self,
        queue: QueueName,
        job_id: &str,
        progress: u8,
    ) -> BoxFuture<'_, Result<(), JobQueueError>> {
        self.inner.update_progress(queue, job_id, progress)
    }

    fn complete(
        &self,
        queue: QueueName,
        job_id: &str,
        result: serde_json::Value,
        now_ms: i64,
    ) -> BoxFuture<'_, Result<(), JobQueueError>> {
        self.inner.complete(queue, job_id, result, now_ms)
    }

    fn retry_later(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>> {
        self.inner.retry_later(record)
    }

    fn fail(&self, record: &JobRecord) -> BoxFuture<'_, Result<(), JobQueueError>> {
        self.inner.fail(record)
    }

    fn remove(
        &self,
        queue: QueueName,
        job_id: &str,
    ) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        self.inner.remove(queue, job_id)
    }

    fn list(
        &self,
        queue: QueueName,
        states: &[JobState],
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>> {
        self.inner.list(queue, states)
    }

    fn list_batch(
        &self,
        queue: QueueName,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<JobRecord>, JobQueueError>> {
        self.inner.list_batch(queue, batch_id)
    }

    fn counts(&self, queue: QueueName) -> BoxFuture<'_, Result<JobCounts, JobQueueError>> {
        self.inner.counts(queue)
    }

    fn promote_due(
        &self,
        queue: QueueName,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        self.inner.promote_due(queue, now_ms, limit)
    }

    fn requeue_stale_active(
        &self,
        queue: QueueName,
        started_before_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        self.inner.requeue_stale_active(queue, started_before_ms, limit)
    }
}

/// Orphan ledger whose writes fail while `broken` is set.
struct FlakyLedger {
    inner: InMemoryOrphanLedger,
    broken: AtomicBool,
}

impl OrphanLedger for FlakyLedger {
    fn record(&self, orphan: &OrphanedCascade) -> BoxFuture<'_, Result<(), JobQueueError>> {
        if self.broken.load(Ordering::SeqCst) {
            return Box::pin(async { Err(JobQueueError::Unavailable("ledger down".into())) });
        }
        self.inner.record(orphan)
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>> {
        self.inner.list()
    }

    fn list_batch(
        &self,
        batch_id: &str,
    ) -> BoxFuture<'_, Result<Vec<OrphanedCascade>, JobQueueError>> {
        self.inner.list_batch(batch_id)
    }

    fn resolve(&self, id: &str) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        self.inner.resolve(id)
    }
}

struct Harness {
    store: InMemoryHierarchyStore,
    queue_backend: Arc<FlakyQueue>,
    ledger: Arc<FlakyLedger>,
    queue: CascadeQueueService,
    orchestrator: CascadeOrchestrator,
    worker: CascadeWorker,
}

fn harness(options: JobOptions) -> Harness {
    let store = InMemoryHierarchyStore::new();
    let queue_backend = Arc::new(FlakyQueue {
        inner: InMemoryCascadeQueue::new(),
        broken: AtomicBool::new(false),
    });
    let ledger = Arc::new(FlakyLedger {
        inner: InMemoryOrphanLedger::new(),
        broken: AtomicBool::new(false),
    });
    let queue = CascadeQueueService::new(
        queue_backend.clone(),
        Arc::new(InMemoryDeadLetterStore::new()),
        ledger.clone(),
        options,
        50,
    );
    let locks = Arc::new(LockProvider::new(
        Arc::new(InMemoryLockBackend::new()),
        LockSettings::default(),
        CircuitBreakerConfig::default(),
    ));
    let worker = CascadeWorker::new(Arc::new(store.clone()), locks, queue.clone());
    Harness {
        store,
        queue_backend,
        ledger,
        orchestrator: CascadeOrchestrator::new(queue.clone()),
        queue,
        worker,
    }
}

fn published_chain(store: &InMemoryHierarchyStore) {
    store.insert(EntityRecord::new(EntityKind::Category, "C", Status::Published));
    store.insert(EntityRecord::new(EntityKind::Course, "X", Status::Published).with_parent("C"));
    store.insert(EntityRecord::new(EntityKind::Chapter, "Y", Status::Published).with_parent("X"));
}

#[tokio::test]
async fn batch_archive_updates_whole_subtree() {
    let h = harness(JobOptions::default());
    published_chain(&h.store);

    let started = h
        .orchestrator
        .start_bulk_cascade(
            vec![EntityUpdate::new(EntityKind::Category, "C", Status::Archived)],
            "admin",
        )
        .await
        .expect("start");
    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].disposition, Disposition::Completed);

    assert_eq!(h.store.status_of(EntityKind::Category, "C"), Some(Status::Archived));
    assert_eq!(h.store.status_of(EntityKind::Course, "X"), Some(Status::Archived));
    assert_eq!(h.store.status_of(EntityKind::Chapter, "Y"), Some(Status::Archived));

    let raw = h.queue.get_batch_progress(&started.batch_id).await.expect("progress");
    let result = raw.batch_job.and_then(|job| job.result).expect("result");
    assert_eq!(result["totalUpdated"], json!(2));
    assert_eq!(result["results"][0]["rootUpdated"], json!(true));
    assert_eq!(result["committed"], json!(true));

    let progress = h.orchestrator.get_progress(&started.batch_id).await.expect("progress");
    assert!(progress.is_done);
    assert_eq!(progress.percentage, 100);
    assert_eq!(h.store.held_advisory_locks(), 0);
}

#[tokio::test]
async fn level_archive_walks_one_level_per_job() {
    let h = harness(JobOptions::default());
    published_chain(&h.store);

    let started = h
        .orchestrator
        .start_cascade(EntityKind::Category, "C", Status::Archived, "admin")
        .await
        .expect("start");
    assert_eq!(started.approach, CascadeApproach::LevelByLevel);

    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed.len(), 3);
    assert!(processed.iter().all(|job| job.disposition == Disposition::Completed));
    assert_eq!(processed[1].job_id, format!("{}-L1-course-X", started.batch_id));

    assert_eq!(h.store.status_of(EntityKind::Course, "X"), Some(Status::Archived));
    assert_eq!(h.store.status_of(EntityKind::Chapter, "Y"), Some(Status::Archived));

    let progress = h.orchestrator.get_progress(&started.batch_id).await.expect("progress");
    assert!(progress.is_done);
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 3);
    let per_level: Vec<(u32, u64)> = progress
        .levels
        .iter()
        .map(|level| (level.level, level.completed))
        .collect();
    assert_eq!(per_level, vec![(0, 1), (1, 1), (2, 1)]);

    let level1 = h
        .queue_backend
        .get(QueueName::Level, &processed[1].job_id)
        .await
        .expect("get")
        .expect("job");
    let level0 = h
        .queue_backend
        .get(QueueName::Level, &processed[0].job_id)
        .await
        .expect("get")
        .expect("job");
    let updated = level0.result.expect("l0")["directChildrenUpdated"].as_u64().unwrap_or(0)
        + level1.result.expect("l1")["directChildrenUpdated"].as_u64().unwrap_or(0);
    assert_eq!(updated, 2);
}

#[tokio::test]
async fn batch_item_failure_keeps_other_items_committed() {
    let h = harness(JobOptions {
        attempts: 3,
        ..JobOptions::default()
    });
    h.store.insert(EntityRecord::new(EntityKind::Category, "C1", Status::Published));
    h.store.insert(EntityRecord::new(EntityKind::Category, "C2", Status::Inactive));
    h.store.insert(EntityRecord::new(EntityKind::Course, "X1", Status::Inactive).with_parent("C2"));

    let started = h
        .orchestrator
        .start_bulk_cascade(
            vec![
                EntityUpdate::new(EntityKind::Category, "C1", Status::Inactive),
                EntityUpdate::new(EntityKind::Course, "X1", Status::Published),
            ],
            "admin",
        )
        .await
        .expect("start");
    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].disposition, Disposition::Retrying);

    assert_eq!(h.store.status_of(EntityKind::Category, "C1"), Some(Status::Inactive));
    assert_eq!(h.store.status_of(EntityKind::Course, "X1"), Some(Status::Inactive));

    let record = h
        .queue_backend
        .get(QueueName::Batch, &started.batch_id)
        .await
        .expect("get")
        .expect("job");
    assert_eq!(record.state, JobState::Delayed);
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("Cascade batch partially failed: 1/2 entities failed")
    );
    let result = record.result.expect("diagnostics");
    assert_eq!(result["failedCount"], json!(1));
    assert!(result["results"][1]["error"].is_string());
}

#[tokio::test]
async fn orphaned_level_blocks_completion_until_reconciled() {
    let h = harness(JobOptions::default());
    published_chain(&h.store);
    h.queue_backend.broken.store(true, Ordering::SeqCst);

    let started = h
        .orchestrator
        .start_cascade(EntityKind::Category, "C", Status::Archived, "admin")
        .await
        .expect("start");
    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].disposition, Disposition::Completed);
    assert_eq!(h.store.status_of(EntityKind::Course, "X"), Some(Status::Archived));
    assert_eq!(h.store.status_of(EntityKind::Chapter, "Y"), Some(Status::Published));

    let progress = h.orchestrator.get_progress(&started.batch_id).await.expect("progress");
    assert_eq!(progress.completed, progress.total);
    assert_eq!(progress.orphaned.len(), 1);
    assert!(!progress.is_done);

    h.queue_backend.broken.store(false, Ordering::SeqCst);
    let report = h.queue.reconcile_orphans().await.expect("reconcile");
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.requeued_jobs, 1);

    h.worker.drain(10).await.expect("drain");
    assert_eq!(h.store.status_of(EntityKind::Chapter, "Y"), Some(Status::Archived));
    let progress = h.orchestrator.get_progress(&started.batch_id).await.expect("progress");
    assert!(progress.orphaned.is_empty());
    assert!(progress.is_done);
}

#[tokio::test]
async fn exhausted_job_lands_in_dead_letter_queue_and_can_be_retried() {
    let h = harness(JobOptions {
        attempts: 1,
        ..JobOptions::default()
    });
    let started = h
        .orchestrator
        .start_bulk_cascade(
            vec![EntityUpdate::new(EntityKind::Course, "missing", Status::Archived)],
            "admin",
        )
        .await
        .expect("start");
    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed[0].disposition, Disposition::DeadLettered);

    let dlq = DeadLetterService::new(h.queue.clone());
    let page = dlq.list(DlqQuery::default()).await.expect("list");
    assert_eq!(page.total, 1);
    let entry_id = page.jobs[0].id.clone();

    let progress = h.orchestrator.get_progress(&started.batch_id).await.expect("progress");
    assert!(progress.is_done);
    assert_eq!(progress.failed, 1);

    h.store.insert(EntityRecord::new(EntityKind::Course, "missing", Status::Published));
    let new_batch = dlq.retry(&entry_id).await.expect("retry");
    assert_ne!(new_batch, started.batch_id);
    assert_eq!(dlq.stats().await.expect("stats").total, 0);

    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed[0].disposition, Disposition::Completed);
    assert_eq!(h.store.status_of(EntityKind::Course, "missing"), Some(Status::Archived));
}

#[tokio::test]
async fn retried_level_job_requeues_children_it_already_corrected() {
    let h = harness(JobOptions::default());
    published_chain(&h.store);
    h.queue_backend.broken.store(true, Ordering::SeqCst);
    h.ledger.broken.store(true, Ordering::SeqCst);

    let started = h
        .orchestrator
        .start_cascade(EntityKind::Category, "C", Status::Archived, "admin")
        .await
        .expect("start");
    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].disposition, Disposition::Retrying);
    // The level committed even though its follow-on jobs were lost.
    assert_eq!(h.store.status_of(EntityKind::Course, "X"), Some(Status::Archived));
    assert_eq!(h.store.status_of(EntityKind::Chapter, "Y"), Some(Status::Published));

    h.queue_backend.broken.store(false, Ordering::SeqCst);
    h.ledger.broken.store(false, Ordering::SeqCst);
    let promoted = h
        .queue_backend
        .promote_due(QueueName::Level, i64::MAX, 10)
        .await
        .expect("promote");
    assert_eq!(promoted, 1);

    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed.len(), 3);
    assert!(processed.iter().all(|job| job.disposition == Disposition::Completed));
    assert_eq!(processed[1].job_id, format!("{}-L1-course-X", started.batch_id));
    assert_eq!(h.store.status_of(EntityKind::Chapter, "Y"), Some(Status::Archived));

    let progress = h.orchestrator.get_progress(&started.batch_id).await.expect("progress");
    assert!(progress.orphaned.is_empty());
    assert!(progress.is_done);
    assert_eq!(progress.completed, 3);
}

#[tokio::test]
async fn stale_level_job_resumes_cascade_after_worker_crash() {
    let h = harness(JobOptions::default());
    published_chain(&h.store);

    let started = h
        .orchestrator
        .start_cascade(EntityKind::Category, "C", Status::Archived, "admin")
        .await
        .expect("start");
    let leased = h
        .queue
        .next_job(QueueName::Level, Duration::ZERO)
        .await
        .expect("lease")
        .expect("level 0 job");
    assert_eq!(leased.attempts_made, 0);
    // The crashed worker committed its level before dying.
    h.store.insert(EntityRecord::new(EntityKind::Category, "C", Status::Archived));
    h.store.insert(EntityRecord::new(EntityKind::Course, "X", Status::Archived).with_parent("C"));

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.queue.requeue_stale(Duration::ZERO, 10).await.expect("reap"), 1);

    let processed = h.worker.drain(10).await.expect("drain");
    assert_eq!(processed.len(), 3);
    assert_eq!(h.store.status_of(EntityKind::Chapter, "Y"), Some(Status::Archived));
    let progress = h.orchestrator.get_progress(&started.batch_id).await.expect("progress");
    assert!(progress.is_done);
}
