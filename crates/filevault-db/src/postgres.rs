use crate::repository::{FileRepository, FileTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filevault_core::{AppError, File, FileStatus, NewFile};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const FILE_COLUMNS: &str = "id, name, size, content_type, storage_key, status, hash, upload_id, \
                            created_at, updated_at, deleted_at";

/// Postgres-backed repository over the `files` table.
#[derive(Clone)]
pub struct PgFileRepository {
    pool: PgPool,
}

impl PgFileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn ensure_affected(rows: u64, id: Uuid) -> Result<(), AppError> {
    if rows == 0 {
        return Err(AppError::not_found_file(id));
    }
    Ok(())
}

#[async_trait]
impl FileRepository for PgFileRepository {
    #[tracing::instrument(skip(self, new_file), fields(db.table = "files", db.operation = "insert", storage_key = %new_file.storage_key))]
    async fn create(&self, new_file: NewFile) -> Result<File, AppError> {
        let file = sqlx::query_as::<_, File>(&format!(
            r#"
            INSERT INTO files (id, name, size, content_type, storage_key, status, upload_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            RETURNING {}
            "#,
            FILE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&new_file.name)
        .bind(new_file.size)
        .bind(&new_file.content_type)
        .bind(&new_file.storage_key)
        .bind(new_file.status)
        .bind(&new_file.upload_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(file)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select", db.record_id = %id))]
    async fn get_by_id(&self, id: Uuid) -> Result<File, AppError> {
        sqlx::query_as::<_, File>(&format!(
            "SELECT {} FROM files WHERE id = $1 AND deleted_at IS NULL",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found_file(id))
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select"))]
    async fn get_by_storage_key(&self, storage_key: &str) -> Result<Option<File>, AppError> {
        let file = sqlx::query_as::<_, File>(&format!(
            "SELECT {} FROM files WHERE storage_key = $1 AND deleted_at IS NULL",
            FILE_COLUMNS
        ))
        .bind(storage_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(file)
    }

    #[tracing::instrument(skip(self, file), fields(db.table = "files", db.operation = "update", db.record_id = %file.id))]
    async fn update(&self, file: &File) -> Result<File, AppError> {
        sqlx::query_as::<_, File>(&format!(
            r#"
            UPDATE files
            SET name = $2, size = $3, content_type = $4, storage_key = $5, status = $6,
                hash = $7, upload_id = $8, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {}
            "#,
            FILE_COLUMNS
        ))
        .bind(file.id)
        .bind(&file.name)
        .bind(file.size)
        .bind(&file.content_type)
        .bind(&file.storage_key)
        .bind(file.status)
        .bind(&file.hash)
        .bind(&file.upload_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found_file(file.id))
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id))]
    async fn update_status(&self, id: Uuid, status: FileStatus) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE files SET status = $2, updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        ensure_affected(result.rows_affected(), id)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "delete", db.record_id = %id))]
    async fn soft_delete(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE files SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        ensure_affected(result.rows_affected(), id)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "delete", db.record_id = %id))]
    async fn purge(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select"))]
    async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<File>, i64), AppError> {
        let files = sqlx::query_as::<_, File>(&format!(
            r#"
            SELECT {}
            FROM files
            WHERE deleted_at IS NULL
            ORDER BY created_at DESC, id
            LIMIT $1 OFFSET $2
            "#,
            FILE_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE deleted_at IS NULL")
            .fetch_one(&self.pool)
            .await?;

        Ok((files, total))
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select"))]
    async fn list_stale(
        &self,
        status: FileStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<File>, AppError> {
        let files = sqlx::query_as::<_, File>(&format!(
            r#"
            SELECT {}
            FROM files
            WHERE status = $1 AND updated_at < $2 AND deleted_at IS NULL
            ORDER BY updated_at
            LIMIT $3
            "#,
            FILE_COLUMNS
        ))
        .bind(status)
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(files)
    }

    async fn begin(&self) -> Result<Box<dyn FileTransaction>, AppError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgFileTransaction { tx }))
    }
}

/// Wraps a sqlx transaction; sqlx rolls back on drop when not committed.
pub struct PgFileTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl FileTransaction for PgFileTransaction {
    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id))]
    async fn update_status(&mut self, id: Uuid, status: FileStatus) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE files SET status = $2, updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(status)
        .execute(&mut *self.tx)
        .await?;

        ensure_affected(result.rows_affected(), id)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "delete", db.record_id = %id))]
    async fn soft_delete(&mut self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE files SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        ensure_affected(result.rows_affected(), id)
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
