use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filevault_core::{AppError, File, FileStatus, NewFile};
use uuid::Uuid;

/// Persistence contract for file records.
///
/// Every read excludes soft-deleted rows. Identity and timestamps are assigned
/// by the implementation.
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Insert a new record. A duplicate storage key is a `Conflict`, which
    /// callers treat as an upstream failure.
    async fn create(&self, new_file: NewFile) -> Result<File, AppError>;

    async fn get_by_id(&self, id: Uuid) -> Result<File, AppError>;

    async fn get_by_storage_key(&self, storage_key: &str) -> Result<Option<File>, AppError>;

    /// Overwrite every mutable field of an existing record.
    async fn update(&self, file: &File) -> Result<File, AppError>;

    async fn update_status(&self, id: Uuid, status: FileStatus) -> Result<(), AppError>;

    /// Mark a record deleted. Deleting twice is `NotFound`.
    async fn soft_delete(&self, id: Uuid) -> Result<(), AppError>;

    /// Remove a record outright. Only used to undo a staged row that never
    /// received its bytes.
    async fn purge(&self, id: Uuid) -> Result<(), AppError>;

    /// One page, newest first, with the total number of live records.
    async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<File>, i64), AppError>;

    /// Live records in `status` not touched since `older_than`, oldest first.
    async fn list_stale(
        &self,
        status: FileStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<File>, AppError>;

    async fn begin(&self) -> Result<Box<dyn FileTransaction>, AppError>;
}

/// A scoped unit of work. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait FileTransaction: Send {
    async fn update_status(&mut self, id: Uuid, status: FileStatus) -> Result<(), AppError>;

    async fn soft_delete(&mut self, id: Uuid) -> Result<(), AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;

    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}
