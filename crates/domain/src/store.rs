use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::hierarchy::{EntityKind, EntityRecord, EntityWithChildren};
use crate::ports::BoxFuture;
use crate::ports::store::{HierarchyStore, HierarchyTx, StoreError};
use crate::status::Status;

type EntityKey = (EntityKind, String);

#[derive(Default)]
struct StoreState {
    entities: BTreeMap<EntityKey, EntityRecord>,
    advisory_locks: HashSet<i64>,
}

/// Hierarchy store kept in process memory.
///
/// Transactions buffer their writes and apply them on commit. Reads inside a
/// transaction see its own buffered writes.
#[derive(Clone, Default)]
pub struct InMemoryHierarchyStore {
    inner: Arc<Mutex<StoreState>>,
}

impl InMemoryHierarchyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: EntityRecord) {
        let mut guard = self.inner.lock().expect("hierarchy store lock");
        guard
            .entities
            .insert((record.kind, record.id.clone()), record);
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<EntityRecord> {
        let guard = self.inner.lock().expect("hierarchy store lock");
        guard.entities.get(&(kind, id.to_string())).cloned()
    }

    pub fn status_of(&self, kind: EntityKind, id: &str) -> Option<Status> {
        self.get(kind, id).map(|record| record.status)
    }

    pub fn held_advisory_locks(&self) -> usize {
        let guard = self.inner.lock().expect("hierarchy store lock");
        guard.advisory_locks.len()
    }
}

impl HierarchyStore for InMemoryHierarchyStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn HierarchyTx>, StoreError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let tx: Box<dyn HierarchyTx> = Box::new(InMemoryTx {
                inner,
                writes: BTreeMap::new(),
                savepoints: Vec::new(),
                advisory_keys: Vec::new(),
            });
            Ok(tx)
        })
    }
}

struct InMemoryTx {
    inner: Arc<Mutex<StoreState>>,
    writes: BTreeMap<EntityKey, Status>,
    savepoints: Vec<(String, BTreeMap<EntityKey, Status>)>,
    advisory_keys: Vec<i64>,
}

impl InMemoryTx {
    fn read(&self, kind: EntityKind, id: &str) -> Option<EntityRecord> {
        let guard = self.inner.lock().expect("hierarchy store lock");
        let key = (kind, id.to_string());
        let mut record = guard.entities.get(&key).cloned()?;
        if let Some(status) = self.writes.get(&key) {
            record.status = *status;
        }
        Some(record)
    }

    fn children_of(&self, parent_kind: EntityKind, parent_ids: &[String]) -> Vec<EntityRecord> {
        let Some(child_kind) = parent_kind.child() else {
            return Vec::new();
        };
        let guard = self.inner.lock().expect("hierarchy store lock");
        let mut out = Vec::new();
        for parent_id in parent_ids {
            for ((kind, id), record) in guard.entities.iter() {
                if *kind != child_kind || record.parent_id.as_deref() != Some(parent_id.as_str()) {
                    continue;
                }
                let mut record = record.clone();
                if let Some(status) = self.writes.get(&(*kind, id.clone())) {
                    record.status = *status;
                }
                out.push(record);
            }
        }
        out
    }

    fn exists(&self, kind: EntityKind, id: &str) -> bool {
        let guard = self.inner.lock().expect("hierarchy store lock");
        guard.entities.contains_key(&(kind, id.to_string()))
    }

    fn release_advisory_locks(&mut self) {
        if self.advisory_keys.is_empty() {
            return;
        }
        let mut guard = self.inner.lock().expect("hierarchy store lock");
        for key in self.advisory_keys.drain(..) {
            guard.advisory_locks.remove(&key);
        }
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        self.release_advisory_locks();
    }
}

impl HierarchyTx for InMemoryTx {
    fn find_with_direct_children(
        &mut self,
        kind: EntityKind,
        id: &str,
    ) -> BoxFuture<'_, Result<Option<EntityWithChildren>, StoreError>> {
        let id = id.to_string();
        Box::pin(async move {
            let Some(entity) = self.read(kind, &id) else {
                return Ok(None);
            };
            let parent_status = match (kind.parent(), entity.parent_id.as_deref()) {
                (Some(parent_kind), Some(parent_id)) => {
                    self.read(parent_kind, parent_id).map(|parent| parent.status)
                }
                _ => None,
            };
            let children = self.children_of(kind, std::slice::from_ref(&entity.id));
            Ok(Some(EntityWithChildren {
                entity,
                parent_status,
                children,
            }))
        })
    }

    fn find_children(
        &mut self,
        parent_kind: EntityKind,
        parent_ids: &[String],
    ) -> BoxFuture<'_, Result<Vec<EntityRecord>, StoreError>> {
        let parent_ids = parent_ids.to_vec();
        Box::pin(async move { Ok(self.children_of(parent_kind, &parent_ids)) })
    }

    fn update_status(
        &mut self,
        kind: EntityKind,
        id: &str,
        status: Status,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let id = id.to_string();
        Box::pin(async move {
            if !self.exists(kind, &id) {
                return Ok(false);
            }
            self.writes.insert((kind, id), status);
            Ok(true)
        })
    }

    fn bulk_update_status(
        &mut self,
        kind: EntityKind,
        ids: &[String],
        status: Status,
    ) -> BoxFuture<'_, Result<u64, StoreError>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            let mut updated = 0;
            for id in ids {
                if self.exists(kind, &id) {
                    self.writes.insert((kind, id), status);
                    updated += 1;
                }
            }
            Ok(updated)
        })
    }

    fn savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = name.to_string();
        Box::pin(async move {
            self.savepoints.push((name, self.writes.clone()));
            Ok(())
        })
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = name.to_string();
        Box::pin(async move {
            let position = self
                .savepoints
                .iter()
                .rposition(|(saved, _)| *saved == name)
                .ok_or_else(|| StoreError::Operation(format!("unknown savepoint {name}")))?;
            // The savepoint itself survives a rollback to it.
            self.savepoints.truncate(position + 1);
            self.writes = self.savepoints[position].1.clone();
            Ok(())
        })
    }

    fn release_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = name.to_string();
        Box::pin(async move {
            let position = self
                .savepoints
                .iter()
                .rposition(|(saved, _)| *saved == name)
                .ok_or_else(|| StoreError::Operation(format!("unknown savepoint {name}")))?;
            self.savepoints.truncate(position);
            Ok(())
        })
    }

    fn try_advisory_lock(&mut self, key: i64) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            if self.advisory_keys.contains(&key) {
                return Ok(true);
            }
            let acquired = {
                let mut guard = self.inner.lock().expect("hierarchy store lock");
                guard.advisory_locks.insert(key)
            };
            if acquired {
                self.advisory_keys.push(key);
            }
            Ok(acquired)
        })
    }

    fn commit(mut self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            let writes = std::mem::take(&mut self.writes);
            {
                let mut guard = self.inner.lock().expect("hierarchy store lock");
                for (key, status) in writes {
                    if let Some(record) = guard.entities.get_mut(&key) {
                        record.status = status;
                    }
                }
            }
            self.release_advisory_locks();
            Ok(())
        })
    }

    fn rollback(mut self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            self.writes.clear();
            self.release_advisory_locks();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> InMemoryHierarchyStore {
        let store = InMemoryHierarchyStore::new();
        store.insert(EntityRecord::new(EntityKind::Category, "C", Status::Published));
        store.insert(EntityRecord::new(EntityKind::Course, "X", Status::Published).with_parent("C"));
        store.insert(EntityRecord::new(EntityKind::Chapter, "Y", Status::Draft).with_parent("X"));
        store
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = seeded();
        let mut tx = store.begin().await.expect("begin");
        assert!(
            tx.update_status(EntityKind::Course, "X", Status::Archived)
                .await
                .expect("update")
        );
        let loaded = tx
            .find_with_direct_children(EntityKind::Course, "X")
            .await
            .expect("find")
            .expect("course");
        assert_eq!(loaded.entity.status, Status::Archived);
        assert_eq!(loaded.parent_status, Some(Status::Published));
        assert_eq!(loaded.children.len(), 1);
        assert_eq!(store.status_of(EntityKind::Course, "X"), Some(Status::Published));

        tx.commit().await.expect("commit");
        assert_eq!(store.status_of(EntityKind::Course, "X"), Some(Status::Archived));
    }

    #[tokio::test]
    async fn rollback_to_savepoint_discards_later_writes_only() {
        let store = seeded();
        let mut tx = store.begin().await.expect("begin");
        tx.update_status(EntityKind::Category, "C", Status::Inactive)
            .await
            .expect("update");
        tx.savepoint("item_1").await.expect("savepoint");
        tx.update_status(EntityKind::Course, "X", Status::Archived)
            .await
            .expect("update");
        tx.rollback_to_savepoint("item_1").await.expect("rollback to");
        tx.commit().await.expect("commit");

        assert_eq!(store.status_of(EntityKind::Category, "C"), Some(Status::Inactive));
        assert_eq!(store.status_of(EntityKind::Course, "X"), Some(Status::Published));
    }

    #[tokio::test]
    async fn advisory_locks_are_released_when_transaction_ends() {
        let store = seeded();
        let mut first = store.begin().await.expect("begin");
        let mut second = store.begin().await.expect("begin");
        assert!(first.try_advisory_lock(42).await.expect("lock"));
        assert!(!second.try_advisory_lock(42).await.expect("lock"));

        first.rollback().await.expect("rollback");
        assert!(second.try_advisory_lock(42).await.expect("lock"));
        drop(second);
        assert_eq!(store.held_advisory_locks(), 0);
    }

    #[tokio::test]
    async fn missing_entities_are_not_updated() {
        let store = seeded();
        let mut tx = store.begin().await.expect("begin");
        assert!(
            !tx.update_status(EntityKind::Lesson, "nope", Status::Archived)
                .await
                .expect("update")
        );
        let count = tx
            .bulk_update_status(
                EntityKind::Course,
                &["X".to_string(), "ghost".to_string()],
                Status::Archived,
            )
            .await
            .expect("bulk");
        assert_eq!(count, 1);
    }
}
