use std::sync::Arc;

use serde::Serialize;

use crate::DomainResult;
use crate::error::DomainError;
use crate::hierarchy::{EntityKind, EntityRecord};
use crate::lock::{LockProvider, entity_lock_key};
use crate::orchestrator::{CascadeOrchestrator, CascadeStarted};
use crate::ports::store::{HierarchyStore, HierarchyTx};
use crate::status::Status;
use crate::validation::StatusValidationService;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeResult {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub previous_status: Status,
    pub new_status: Status,
    /// `None` when the change committed but no cascade could be queued.
    pub cascade: Option<CascadeStarted>,
}

/// Synchronous status change: validate, persist, then hand the descendants
/// to the cascade pipeline.
#[derive(Clone)]
pub struct StatusChangeService {
    store: Arc<dyn HierarchyStore>,
    locks: Arc<LockProvider>,
    orchestrator: CascadeOrchestrator,
    validator: StatusValidationService,
}

impl StatusChangeService {
    pub fn new(
        store: Arc<dyn HierarchyStore>,
        locks: Arc<LockProvider>,
        orchestrator: CascadeOrchestrator,
    ) -> Self {
        Self {
            store,
            locks,
            orchestrator,
            validator: StatusValidationService::new(),
        }
    }

    pub async fn change_status(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        new_status: Status,
        user_id: &str,
    ) -> DomainResult<StatusChangeResult> {
        let key = entity_lock_key(entity_type, entity_id);
        let mut tx = self.store.begin().await?;
        let token = match self.locks.acquire_default(tx.as_mut(), &key).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        key = %key,
                        error = %rollback_err,
                        "status change rollback failed"
                    );
                }
                return Err(DomainError::Conflict(format!(
                    "{entity_type} {entity_id} is being modified"
                )));
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        key = %key,
                        error = %rollback_err,
                        "status change rollback failed"
                    );
                }
                return Err(err);
            }
        };

        let applied = match self
            .apply(tx.as_mut(), entity_type, entity_id, new_status)
            .await
        {
            Ok(previous) => tx
                .commit()
                .await
                .map(|()| previous)
                .map_err(DomainError::from),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        key = %key,
                        error = %rollback_err,
                        "status change rollback failed"
                    );
                }
                Err(err)
            }
        };
        self.locks.release_quietly(&key, &token).await;
        let previous_status = applied?;

        tracing::info!(
            entity_type = %entity_type,
            entity_id,
            from = %previous_status,
            to = %new_status,
            user_id,
            "status changed"
        );

        let cascade = if entity_type.is_leaf() || previous_status == new_status {
            None
        } else {
            match self
                .orchestrator
                .start_cascade(entity_type, entity_id, new_status, user_id)
                .await
            {
                Ok(started) => Some(started),
                Err(err) => {
                    tracing::error!(
                        entity_type = %entity_type,
                        entity_id,
                        error = %err,
                        "cascade could not be started after status change"
                    );
                    None
                }
            }
        };

        Ok(StatusChangeResult {
            entity_type,
            entity_id: entity_id.to_string(),
            previous_status,
            new_status,
            cascade,
        })
    }

    async fn apply(
        &self,
        tx: &mut dyn HierarchyTx,
        kind: EntityKind,
        id: &str,
        target: Status,
    ) -> DomainResult<Status> {
        let loaded = tx
            .find_with_direct_children(kind, id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("{kind} {id}")))?;
        let entity: &EntityRecord = &loaded.entity;

        self.validator
            .validate_transition(kind, entity.status, target)?;
        if loaded.parent_status.is_some() {
            self.validator.validate_transition_with_parent(
                kind,
                entity.status,
                target,
                loaded.parent_status,
            )?;
        }
        self.validator
            .validate_with_children(entity, target, &loaded.children)?;

        if entity.status != target {
            tx.update_status(kind, id, target).await?;
        }
        Ok(entity.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::ViolationKind;
    use crate::jobs::JobOptions;
    use crate::lock::{InMemoryLockBackend, LockSettings};
    use crate::hierarchy::EntityWithChildren;
    use crate::orchestrator::CascadeApproach;
    use crate::ports::BoxFuture;
    use crate::ports::store::StoreError;
    use crate::queue::CascadeQueueService;
    use crate::queue::memory::{InMemoryCascadeQueue, InMemoryDeadLetterStore, InMemoryOrphanLedger};
    use crate::store::InMemoryHierarchyStore;

    fn service(store: &InMemoryHierarchyStore) -> StatusChangeService {
        service_over(Arc::new(store.clone()))
    }

    fn service_over(store: Arc<dyn HierarchyStore>) -> StatusChangeService {
        let queue = CascadeQueueService::new(
            Arc::new(InMemoryCascadeQueue::new()),
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryOrphanLedger::new()),
            JobOptions::default(),
            50,
        );
        let locks = LockProvider::new(
            Arc::new(InMemoryLockBackend::new()),
            LockSettings::default(),
            CircuitBreakerConfig::default(),
        );
        StatusChangeService::new(
            store,
            Arc::new(locks),
            CascadeOrchestrator::new(queue),
        )
    }

    fn seeded() -> InMemoryHierarchyStore {
        let store = InMemoryHierarchyStore::new();
        store.insert(EntityRecord::new(EntityKind::Category, "cat-1", Status::Published));
        store.insert(
            EntityRecord::new(EntityKind::Course, "co-1", Status::Published).with_parent("cat-1"),
        );
        store.insert(
            EntityRecord::new(EntityKind::Chapter, "ch-1", Status::Published).with_parent("co-1"),
        );
        store
    }

    #[tokio::test]
    async fn change_commits_and_starts_cascade() {
        let store = seeded();
        let result = service(&store)
            .change_status(EntityKind::Course, "co-1", Status::Inactive, "u-1")
            .await
            .expect("change");
        assert_eq!(result.previous_status, Status::Published);
        assert_eq!(store.status_of(EntityKind::Course, "co-1"), Some(Status::Inactive));
        let cascade = result.cascade.expect("cascade");
        assert_eq!(cascade.approach, CascadeApproach::LevelByLevel);
        // Descendants are left to the cascade.
        assert_eq!(store.status_of(EntityKind::Chapter, "ch-1"), Some(Status::Published));
        assert_eq!(store.held_advisory_locks(), 0);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_nothing_changes() {
        let store = seeded();
        let err = service(&store)
            .change_status(EntityKind::Course, "co-1", Status::Draft, "u-1")
            .await
            .expect_err("published to draft");
        match err {
            DomainError::Policy(violation) => {
                assert_eq!(violation.kind, ViolationKind::InvalidTransition)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.status_of(EntityKind::Course, "co-1"), Some(Status::Published));
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let store = seeded();
        let err = service(&store)
            .change_status(EntityKind::Lesson, "nope", Status::Archived, "u-1")
            .await
            .expect_err("missing");
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[tokio::test]
    async fn leaf_change_has_no_cascade() {
        let store = seeded();
        store.insert(
            EntityRecord::new(EntityKind::Lesson, "l-1", Status::Draft).with_parent("ch-1"),
        );
        let result = service(&store)
            .change_status(EntityKind::Lesson, "l-1", Status::Published, "u-1")
            .await
            .expect("change");
        assert!(result.cascade.is_none());
        assert_eq!(store.status_of(EntityKind::Lesson, "l-1"), Some(Status::Published));
    }

    /// Rolls back the inner transaction, then reports the rollback as failed.
    struct FailingRollbackStore(InMemoryHierarchyStore);

    struct FailingRollbackTx(Box<dyn HierarchyTx>);

    impl HierarchyStore for FailingRollbackStore {
        fn name(&self) -> &'static str {
            "failing-rollback"
        }

        fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>> {
            self.0.health_check()
        }

        fn begin(&self) -> BoxFuture<'_, Result<Box<dyn HierarchyTx>, StoreError>> {
            Box::pin(async move {
                let inner = self.0.begin().await?;
                let tx: Box<dyn HierarchyTx> = Box::new(FailingRollbackTx(inner));
                Ok(tx)
            })
        }
    }

    impl HierarchyTx for FailingRollbackTx {
        fn find_with_direct_children(
            &mut self,
            kind: EntityKind,
            id: &str,
        ) -> BoxFuture<'_, Result<Option<EntityWithChildren>, StoreError>> {
            self.0.find_with_direct_children(kind, id)
        }

        fn find_children(
            &mut self,
            parent_kind: EntityKind,
            parent_ids: &[String],
        ) -> BoxFuture<'_, Result<Vec<EntityRecord>, StoreError>> {
            self.0.find_children(parent_kind, parent_ids)
        }

        fn update_status(
            &mut self,
            kind: EntityKind,
            id: &str,
            status: Status,
        ) -> BoxFuture<'_, Result<bool, StoreError>> {
            self.0.update_status(kind, id, status)
        }

        fn bulk_update_status(
            &mut self,
            kind: EntityKind,
            ids: &[String],
            status: Status,
        ) -> BoxFuture<'_, Result<u64, StoreError>> {
            self.0.bulk_update_status(kind, ids, status)
        }

        fn savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
            self.0.savepoint(name)
        }

        fn rollback_to_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
            self.0.rollback_to_savepoint(name)
        }

        fn release_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
            self.0.release_savepoint(name)
        }

        fn try_advisory_lock(&mut self, key: i64) -> BoxFuture<'_, Result<bool, StoreError>> {
            self.0.try_advisory_lock(key)
        }

        fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
            self.0.commit()
        }

        fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
            Box::pin(async move {
                self.0.rollback().await?;
                Err(StoreError::Unavailable("connection reset during rollback".into()))
            })
        }
    }

    #[tokio::test]
    async fn failed_rollback_keeps_original_error_and_frees_lock() {
        let store = seeded();
        let service = service_over(Arc::new(FailingRollbackStore(store.clone())));
        let err = service
            .change_status(EntityKind::Course, "co-1", Status::Draft, "u-1")
            .await
            .expect_err("published to draft");
        assert!(matches!(err, DomainError::Policy(_)), "{err:?}");
        assert_eq!(store.status_of(EntityKind::Course, "co-1"), Some(Status::Published));
        assert_eq!(store.held_advisory_locks(), 0);

        let result = service
            .change_status(EntityKind::Course, "co-1", Status::Inactive, "u-1")
            .await
            .expect("lock was released");
        assert_eq!(result.new_status, Status::Inactive);
    }
}
