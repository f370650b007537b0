#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filevault_core::{AppError, File, FileStatus, NewFile};
use filevault_db::{FileRepository, FileTransaction, InMemoryFileRepository};
use filevault_services::FileService;
use filevault_storage::{
    ByteReader, CompletedPart, LocalStorage, MultipartUpload, ObjectMeta, ObjectStream,
    PresignOptions, Storage, StorageBackend, StorageError, StorageResult,
};
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn injected(what: &str) -> StorageError {
    StorageError::BackendError(format!("injected {} failure", what))
}

/// Local storage with switchable failures.
pub struct FaultyStorage {
    pub local: LocalStorage,
    pub fail_upload: AtomicBool,
    pub fail_presign: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_abort: AtomicBool,
}

impl FaultyStorage {
    pub fn new(local: LocalStorage) -> Self {
        Self {
            local,
            fail_upload: AtomicBool::new(false),
            fail_presign: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_abort: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(injected(what));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn upload(
        &self,
        key: &str,
        reader: ByteReader,
        size: u64,
        content_type: &str,
    ) -> StorageResult<()> {
        Self::check(&self.fail_upload, "upload")?;
        self.local.upload(key, reader, size, content_type).await
    }

    async fn presign_upload_url(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: &str,
    ) -> StorageResult<String> {
        Self::check(&self.fail_presign, "presign")?;
        self.local
            .presign_upload_url(key, expires_in, content_type)
            .await
    }

    async fn init_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> StorageResult<MultipartUpload> {
        self.local.init_multipart_upload(key, content_type).await
    }

    async fn presign_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> StorageResult<String> {
        Self::check(&self.fail_presign, "presign")?;
        self.local
            .presign_part_url(key, upload_id, part_number, expires_in)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.local
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        Self::check(&self.fail_abort, "abort")?;
        self.local.abort_multipart_upload(key, upload_id).await
    }

    async fn presign_download_url(
        &self,
        key: &str,
        expires_in: Duration,
        options: &PresignOptions,
    ) -> StorageResult<String> {
        Self::check(&self.fail_presign, "presign")?;
        self.local
            .presign_download_url(key, expires_in, options)
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        Self::check(&self.fail_delete, "delete")?;
        self.local.delete(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        self.local.head(key).await
    }

    async fn get_object(&self, key: &str) -> StorageResult<ObjectStream> {
        self.local.get_object(key).await
    }

    fn backend_type(&self) -> StorageBackend {
        self.local.backend_type()
    }
}

/// In-memory repository with switchable failures.
#[derive(Clone)]
pub struct FaultyRepository {
    pub inner: InMemoryFileRepository,
    pub fail_create: Arc<AtomicBool>,
    pub fail_commit: Arc<AtomicBool>,
    pub fail_update_status: Arc<AtomicBool>,
}

impl FaultyRepository {
    pub fn new() -> Self {
        Self {
            inner: InMemoryFileRepository::new(),
            fail_create: Arc::new(AtomicBool::new(false)),
            fail_commit: Arc::new(AtomicBool::new(false)),
            fail_update_status: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), AppError> {
        if flag.load(Ordering::SeqCst) {
            return Err(AppError::Internal(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl FileRepository for FaultyRepository {
    async fn create(&self, new_file: NewFile) -> Result<File, AppError> {
        Self::check(&self.fail_create, "create")?;
        self.inner.create(new_file).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<File, AppError> {
        self.inner.get_by_id(id).await
    }

    async fn get_by_storage_key(&self, storage_key: &str) -> Result<Option<File>, AppError> {
        self.inner.get_by_storage_key(storage_key).await
    }

    async fn update(&self, file: &File) -> Result<File, AppError> {
        self.inner.update(file).await
    }

    async fn update_status(&self, id: Uuid, status: FileStatus) -> Result<(), AppError> {
        Self::check(&self.fail_update_status, "update_status")?;
        self.inner.update_status(id, status).await
    }

    async fn soft_delete(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.soft_delete(id).await
    }

    async fn purge(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.purge(id).await
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<File>, i64), AppError> {
        self.inner.list(offset, limit).await
    }

    async fn list_stale(
        &self,
        status: FileStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<File>, AppError> {
        self.inner.list_stale(status, older_than, limit).await
    }

    async fn begin(&self) -> Result<Box<dyn FileTransaction>, AppError> {
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            fail_commit: Arc::clone(&self.fail_commit),
        }))
    }
}

struct FaultyTransaction {
    inner: Box<dyn FileTransaction>,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl FileTransaction for FaultyTransaction {
    async fn update_status(&mut self, id: Uuid, status: FileStatus) -> Result<(), AppError> {
        self.inner.update_status(id, status).await
    }

    async fn soft_delete(&mut self, id: Uuid) -> Result<(), AppError> {
        self.inner.soft_delete(id).await
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        FaultyRepository::check(&self.fail_commit, "commit")?;
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.inner.rollback().await
    }
}

pub struct Harness {
    pub service: FileService,
    pub repo: FaultyRepository,
    pub storage: Arc<FaultyStorage>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(false).await
    }

    pub async fn verifying() -> Self {
        Self::build(true).await
    }

    async fn build(verify_on_confirm: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStorage::new(
            dir.path(),
            "http://localhost:8080/files".to_string(),
            Some("test-secret".to_string()),
        )
        .await
        .unwrap();

        let repo = FaultyRepository::new();
        let storage = Arc::new(FaultyStorage::new(local));
        let service = FileService::new(Arc::new(repo.clone()), storage.clone())
            .with_verify_on_confirm(verify_on_confirm);

        Self {
            service,
            repo,
            storage,
            dir,
        }
    }

    pub async fn read_object(&self, key: &str) -> Vec<u8> {
        let mut object = self.storage.local.get_object(key).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = object.body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    /// Stored objects, multipart staging excluded.
    pub fn object_count(&self) -> usize {
        count_files(&self.dir.path().join("files"))
    }

    pub fn staged_sessions(&self) -> usize {
        std::fs::read_dir(self.dir.path().join(".multipart"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

pub fn reader(data: &[u8]) -> ByteReader {
    Box::pin(std::io::Cursor::new(data.to_vec()))
}
