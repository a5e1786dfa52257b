use thiserror::Error;

use super::BoxFuture;
use crate::hierarchy::{EntityKind, EntityRecord, EntityWithChildren};
use crate::status::Status;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("hierarchy store unavailable: {0}")]
    Unavailable(String),
    #[error("hierarchy store operation failed: {0}")]
    Operation(String),
}

/// Transactional access to the content hierarchy.
pub trait HierarchyStore: Send + Sync {
    fn name(&self) -> &'static str;
    fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>>;
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn HierarchyTx>, StoreError>>;
}

/// An open transaction. Dropping it without `commit` discards its writes.
///
/// Advisory locks taken through `try_advisory_lock` belong to the transaction
/// and are released when it ends, never by an explicit unlock.
pub trait HierarchyTx: Send {
    fn find_with_direct_children(
        &mut self,
        kind: EntityKind,
        id: &str,
    ) -> BoxFuture<'_, Result<Option<EntityWithChildren>, StoreError>>;

    /// Children (of `parent_kind`'s child kind) of every id in `parent_ids`.
    fn find_children(
        &mut self,
        parent_kind: EntityKind,
        parent_ids: &[String],
    ) -> BoxFuture<'_, Result<Vec<EntityRecord>, StoreError>>;

    fn update_status(
        &mut self,
        kind: EntityKind,
        id: &str,
        status: Status,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;

    fn bulk_update_status(
        &mut self,
        kind: EntityKind,
        ids: &[String],
        status: Status,
    ) -> BoxFuture<'_, Result<u64, StoreError>>;

    fn savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>>;
    fn rollback_to_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>>;
    fn release_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>>;

    fn try_advisory_lock(&mut self, key: i64) -> BoxFuture<'_, Result<bool, StoreError>>;

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}
