use std::sync::Arc;

use anyhow::{Result, bail};
use syllabus_domain::analytics::CascadeAnalytics;
use syllabus_domain::dlq::DeadLetterService;
use syllabus_domain::lock::{InMemoryLockBackend, LockProvider};
use syllabus_domain::orchestrator::CascadeOrchestrator;
use syllabus_domain::ports::jobs::{CascadeQueue, DeadLetterStore, OrphanLedger};
use syllabus_domain::ports::lock::LockBackend;
use syllabus_domain::ports::store::HierarchyStore;
use syllabus_domain::processors::CascadeWorker;
use syllabus_domain::queue::CascadeQueueService;
use syllabus_domain::queue::memory::{
    InMemoryCascadeQueue, InMemoryDeadLetterStore, InMemoryOrphanLedger,
};
use syllabus_domain::settings::CascadeSettings;
use syllabus_domain::status_change::StatusChangeService;
use syllabus_domain::store::InMemoryHierarchyStore;

use crate::config::AppConfig;
use crate::db::{DbConfig, PgHierarchyStore};
use crate::jobs::{RedisCascadeQueue, RedisDeadLetterStore, RedisOrphanLedger, connect_manager};
use crate::lock::RedisLockBackend;

/// The wired cascade pipeline shared by the api and the worker.
#[derive(Clone)]
pub struct CascadeRuntime {
    pub settings: CascadeSettings,
    pub store: Arc<dyn HierarchyStore>,
    pub locks: Arc<LockProvider>,
    pub queue: CascadeQueueService,
}

impl CascadeRuntime {
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let settings = config.cascade_settings();

        let store: Arc<dyn HierarchyStore> = match config.data_backend.as_str() {
            "memory" => Arc::new(InMemoryHierarchyStore::new()),
            "postgres" => {
                let store = PgHierarchyStore::connect(&DbConfig::from_app_config(config)).await?;
                store.migrate().await?;
                Arc::new(store)
            }
            other => bail!("unsupported data_backend '{other}'"),
        };

        let (queue, dead_letters, orphans, lock_backend) = match config.queue_backend.as_str() {
            "memory" => {
                let queue: Arc<dyn CascadeQueue> = Arc::new(InMemoryCascadeQueue::new());
                let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new());
                let orphans: Arc<dyn OrphanLedger> = Arc::new(InMemoryOrphanLedger::new());
                let locks: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
                (queue, dead_letters, orphans, locks)
            }
            "redis" => {
                let manager = connect_manager(&config.redis_url).await?;
                let prefix = config.queue_prefix.as_str();
                let queue: Arc<dyn CascadeQueue> =
                    Arc::new(RedisCascadeQueue::with_manager(manager.clone(), prefix));
                let dead_letters: Arc<dyn DeadLetterStore> =
                    Arc::new(RedisDeadLetterStore::with_manager(manager.clone(), prefix));
                let orphans: Arc<dyn OrphanLedger> =
                    Arc::new(RedisOrphanLedger::with_manager(manager.clone(), prefix));
                let locks: Arc<dyn LockBackend> =
                    Arc::new(RedisLockBackend::new(manager, config.lock_prefix.clone()));
                (queue, dead_letters, orphans, locks)
            }
            other => bail!("unsupported queue_backend '{other}'"),
        };

        tracing::info!(
            data_backend = store.name(),
            queue_backend = %config.queue_backend,
            lock_backend = lock_backend.name(),
            "cascade runtime wired"
        );
        Ok(Self::assemble(
            settings,
            store,
            lock_backend,
            queue,
            dead_letters,
            orphans,
        ))
    }

    /// Everything in process memory. Returns the store handle for seeding.
    pub fn in_memory(settings: CascadeSettings) -> (Self, InMemoryHierarchyStore) {
        let store = InMemoryHierarchyStore::new();
        let runtime = Self::assemble(
            settings,
            Arc::new(store.clone()),
            Arc::new(InMemoryLockBackend::new()),
            Arc::new(InMemoryCascadeQueue::new()),
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryOrphanLedger::new()),
        );
        (runtime, store)
    }

    pub fn assemble(
        settings: CascadeSettings,
        store: Arc<dyn HierarchyStore>,
        lock_backend: Arc<dyn LockBackend>,
        queue: Arc<dyn CascadeQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
        orphans: Arc<dyn OrphanLedger>,
    ) -> Self {
        let locks = Arc::new(LockProvider::new(
            lock_backend,
            settings.lock,
            settings.breaker,
        ));
        let queue = CascadeQueueService::new(
            queue,
            dead_letters,
            orphans,
            settings.job,
            settings.enqueue_chunk_size,
        );
        Self {
            settings,
            store,
            locks,
            queue,
        }
    }

    pub fn worker(&self) -> CascadeWorker {
        CascadeWorker::new(self.store.clone(), self.locks.clone(), self.queue.clone())
    }

    pub fn orchestrator(&self) -> CascadeOrchestrator {
        CascadeOrchestrator::new(self.queue.clone())
    }

    pub fn dead_letters(&self) -> DeadLetterService {
        DeadLetterService::new(self.queue.clone())
    }

    pub fn analytics(&self) -> CascadeAnalytics {
        CascadeAnalytics::new(self.queue.clone(), self.dead_letters())
    }

    pub fn status_changes(&self) -> StatusChangeService {
        StatusChangeService::new(self.store.clone(), self.locks.clone(), self.orchestrator())
    }
}
