use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use syllabus_domain::hierarchy::{EntityKind, EntityRecord, EntityWithChildren};
use syllabus_domain::ports::BoxFuture;
use syllabus_domain::ports::store::{HierarchyStore, HierarchyTx, StoreError};
use syllabus_domain::status::Status;

use crate::config::AppConfig;

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS categories (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'DRAFT'
    )",
    "CREATE TABLE IF NOT EXISTS courses (
        id TEXT PRIMARY KEY,
        category_id TEXT NOT NULL REFERENCES categories (id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'DRAFT'
    )",
    "CREATE TABLE IF NOT EXISTS chapters (
        id TEXT PRIMARY KEY,
        course_id TEXT NOT NULL REFERENCES courses (id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'DRAFT'
    )",
    "CREATE TABLE IF NOT EXISTS lessons (
        id TEXT PRIMARY KEY,
        chapter_id TEXT NOT NULL REFERENCES chapters (id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'DRAFT'
    )",
];

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            url: config.database_url.clone(),
            max_connections: config.database_max_connections,
        }
    }
}

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Category => "categories",
        EntityKind::Course => "courses",
        EntityKind::Chapter => "chapters",
        EntityKind::Lesson => "lessons",
    }
}

/// Foreign key column pointing at the parent row.
fn parent_column(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Category => None,
        EntityKind::Course => Some("category_id"),
        EntityKind::Chapter => Some("course_id"),
        EntityKind::Lesson => Some("chapter_id"),
    }
}

fn select_columns(kind: EntityKind) -> String {
    let parent = parent_column(kind).unwrap_or("NULL::text");
    format!("id, status, {parent} AS parent_id")
}

fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        other => StoreError::Operation(other.to_string()),
    }
}

fn to_record(kind: EntityKind, row: (String, String, Option<String>)) -> Result<EntityRecord, StoreError> {
    let (id, status, parent_id) = row;
    let status = Status::parse(&status).ok_or_else(|| {
        StoreError::Operation(format!("{kind} {id} has unknown status '{status}'"))
    })?;
    Ok(EntityRecord {
        kind,
        id,
        status,
        parent_id,
    })
}

fn valid_savepoint(name: &str) -> Result<&str, StoreError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StoreError::Operation(format!("invalid savepoint name '{name}'")))
    }
}

/// Hierarchy tables on Postgres. Advisory locks are transaction scoped
/// (`pg_try_advisory_xact_lock`) and end with commit or rollback.
#[derive(Clone)]
pub struct PgHierarchyStore {
    pool: PgPool,
}

impl PgHierarchyStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(store_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        tracing::info!("hierarchy schema ready");
        Ok(())
    }
}

impl HierarchyStore for PgHierarchyStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let (one,): (i32,) = sqlx::query_as("SELECT 1")
                .fetch_one(&self.pool)
                .await
                .map_err(store_error)?;
            tracing::debug!(result = one, "postgres health check succeeded");
            Ok(())
        })
    }

    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn HierarchyTx>, StoreError>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(store_error)?;
            let tx: Box<dyn HierarchyTx> = Box::new(PgHierarchyTx { tx });
            Ok(tx)
        })
    }
}

struct PgHierarchyTx {
    tx: Transaction<'static, Postgres>,
}

impl PgHierarchyTx {
    async fn find(&mut self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            select_columns(kind),
            table(kind)
        );
        let row: Option<(String, String, Option<String>)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(store_error)?;
        row.map(|row| to_record(kind, row)).transpose()
    }

    async fn children(
        &mut self,
        parent_kind: EntityKind,
        parent_ids: &[String],
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let Some(child_kind) = parent_kind.child() else {
            return Ok(Vec::new());
        };
        let Some(fk) = parent_column(child_kind) else {
            return Ok(Vec::new());
        };
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {fk} = ANY($1) ORDER BY id",
            select_columns(child_kind),
            table(child_kind)
        );
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(&sql)
            .bind(parent_ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error)?;
        rows.into_iter()
            .map(|row| to_record(child_kind, row))
            .collect()
    }

    async fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

impl HierarchyTx for PgHierarchyTx {
    fn find_with_direct_children(
        &mut self,
        kind: EntityKind,
        id: &str,
    ) -> BoxFuture<'_, Result<Option<EntityWithChildren>, StoreError>> {
        let id = id.to_string();
        Box::pin(async move {
            let Some(entity) = self.find(kind, &id).await? else {
                return Ok(None);
            };
            let parent_status = match (kind.parent(), entity.parent_id.clone()) {
                (Some(parent_kind), Some(parent_id)) => self
                    .find(parent_kind, &parent_id)
                    .await?
                    .map(|parent| parent.status),
                _ => None,
            };
            let children = self.children(kind, std::slice::from_ref(&entity.id)).await?;
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
        Box::pin(async move { self.children(parent_kind, &parent_ids).await })
    }

    fn update_status(
        &mut self,
        kind: EntityKind,
        id: &str,
        status: Status,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let id = id.to_string();
        Box::pin(async move {
            let sql = format!("UPDATE {} SET status = $1 WHERE id = $2", table(kind));
            let result = sqlx::query(&sql)
                .bind(status.upper())
                .bind(&id)
                .execute(&mut *self.tx)
                .await
                .map_err(store_error)?;
            Ok(result.rows_affected() == 1)
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
            if ids.is_empty() {
                return Ok(0);
            }
            let sql = format!("UPDATE {} SET status = $1 WHERE id = ANY($2)", table(kind));
            let result = sqlx::query(&sql)
                .bind(status.upper())
                .bind(&ids)
                .execute(&mut *self.tx)
                .await
                .map_err(store_error)?;
            Ok(result.rows_affected())
        })
    }

    fn savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let sql = valid_savepoint(name).map(|name| format!("SAVEPOINT {name}"));
        Box::pin(async move { self.execute(&sql?).await })
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let sql = valid_savepoint(name).map(|name| format!("ROLLBACK TO SAVEPOINT {name}"));
        Box::pin(async move { self.execute(&sql?).await })
    }

    fn release_savepoint(&mut self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let sql = valid_savepoint(name).map(|name| format!("RELEASE SAVEPOINT {name}"));
        Box::pin(async move { self.execute(&sql?).await })
    }

    fn try_advisory_lock(&mut self, key: i64) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
                .bind(key)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(store_error)?;
            Ok(acquired)
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move { self.tx.commit().await.map_err(store_error) })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move { self.tx.rollback().await.map_err(store_error) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savepoint_names_are_identifiers() {
        assert!(valid_savepoint("cascade_item_3").is_ok());
        assert!(valid_savepoint("x; DROP TABLE courses").is_err());
        assert!(valid_savepoint("").is_err());
    }

    #[test]
    fn categories_select_null_parent() {
        assert_eq!(
            select_columns(EntityKind::Category),
            "id, status, NULL::text AS parent_id"
        );
        assert_eq!(
            select_columns(EntityKind::Lesson),
            "id, status, chapter_id AS parent_id"
        );
    }

    #[test]
    fn stored_status_parses_case_insensitively() {
        let record = to_record(
            EntityKind::Course,
            ("c-1".into(), "PUBLISHED".into(), Some("cat-1".into())),
        )
        .expect("record");
        assert_eq!(record.status, Status::Published);
        assert!(to_record(EntityKind::Course, ("c-1".into(), "gone".into(), None)).is_err());
    }
}
