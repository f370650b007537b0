//! Upload orchestrator
//!
//! Three entry protocols share one record lifecycle:
//!
//! - direct: the bytes pass through this service; content type is sniffed
//! - presigned single-shot: the caller PUTs out-of-band, then confirms
//! - presigned multipart: the caller PUTs numbered parts, then completes
//!
//! Every record is created before any remote object is known to exist, so the
//! storage key never changes. Compensation is attempted once and logged; a
//! failed compensation leaves a known-inconsistent state, logged at `error`.

use chrono::Utc;
use filevault_core::constants::{
    DEFAULT_PAGE_SIZE, DOWNLOAD_URL_EXPIRY, MAX_PAGE_SIZE, MAX_PRESIGN_EXPIRY, SNIFF_WINDOW,
    UPLOAD_URL_EXPIRY,
};
use filevault_core::{mime, AppError, File, FileStatus, NewFile};
use filevault_db::FileRepository;
use filevault_storage::keys::{validate_part_number, validate_parts};
use filevault_storage::{
    generate_storage_key, ByteReader, ByteStream, CompletedPart, PresignOptions, Storage,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct PresignedUploadResult {
    pub file_id: Uuid,
    pub upload_url: String,
    pub storage_key: String,
    /// The uploader must send exactly this content type.
    pub content_type: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultipartUploadResult {
    pub file_id: Uuid,
    pub upload_id: String,
    pub storage_key: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartUploadUrl {
    pub file_id: Uuid,
    pub part_number: i32,
    pub url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadUrl {
    pub file_id: Uuid,
    pub url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileList {
    pub files: Vec<File>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

/// An object opened for passthrough to the caller.
pub struct FileDownload {
    pub file: File,
    pub body: ByteStream,
    pub content_length: Option<u64>,
    pub content_type: String,
    /// `inline; filename="..."` or `attachment; filename="..."`
    pub content_disposition: String,
}

fn validate_new_upload(name: &str, size: i64) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::InvalidInput("File name is required".to_string()));
    }
    if size < 0 {
        return Err(AppError::InvalidInput(format!(
            "File size must be non-negative, got {}",
            size
        )));
    }
    Ok(())
}

/// Fill up to `SNIFF_WINDOW` bytes; short reads are retried until EOF.
async fn read_prefix(reader: &mut ByteReader) -> Result<Vec<u8>, AppError> {
    let mut prefix = vec![0u8; SNIFF_WINDOW];
    let mut filled = 0;
    while filled < SNIFF_WINDOW {
        let n = reader
            .read(&mut prefix[filled..])
            .await
            .map_err(|e| AppError::InvalidInput(format!("Failed to read upload stream: {}", e)))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);
    Ok(prefix)
}

fn disposition_type(content_type: &str) -> &'static str {
    if mime::is_previewable(content_type) {
        "inline"
    } else {
        "attachment"
    }
}

fn disposition_header(file: &File) -> String {
    let filename: String = file
        .name
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    format!(
        "{}; filename=\"{}\"",
        disposition_type(&file.content_type),
        filename
    )
}

/// Upload orchestrator over a metadata store and a storage backend.
#[derive(Clone)]
pub struct FileService {
    repo: Arc<dyn FileRepository>,
    storage: Arc<dyn Storage>,
    verify_on_confirm: bool,
}

impl FileService {
    pub fn new(repo: Arc<dyn FileRepository>, storage: Arc<dyn Storage>) -> Self {
        Self {
            repo,
            storage,
            verify_on_confirm: false,
        }
    }

    /// Check that the object exists before confirming a presigned upload.
    pub fn with_verify_on_confirm(mut self, verify: bool) -> Self {
        self.verify_on_confirm = verify;
        self
    }

    /// Direct upload: bytes are proxied through this service.
    ///
    /// The record is staged as `pending` and committed before the transfer.
    /// A failed transfer purges it; a failed status flip deletes the object
    /// and purges it.
    #[tracing::instrument(skip(self, reader), fields(file.operation = "upload_direct"))]
    pub async fn upload(
        &self,
        name: &str,
        declared_content_type: &str,
        size: i64,
        mut reader: ByteReader,
    ) -> Result<File, AppError> {
        let start = std::time::Instant::now();
        validate_new_upload(name, size)?;

        // 1. Sniff the real content type; the declared one is ignored
        let prefix = read_prefix(&mut reader).await?;
        let content_type = mime::sniff(&prefix).to_string();
        if !declared_content_type.is_empty()
            && mime::base_type(declared_content_type) != mime::base_type(&content_type)
        {
            tracing::debug!(
                declared = %declared_content_type,
                detected = %content_type,
                "Declared content type overridden by sniffing"
            );
        }

        // 2. Replay the prefix ahead of the rest of the stream
        let body: ByteReader = Box::pin(std::io::Cursor::new(prefix).chain(reader));

        // 3. Stage the record
        let storage_key = generate_storage_key(name, &content_type);
        let file = self
            .repo
            .create(NewFile::pending(name, size, &content_type, &storage_key))
            .await?;

        // 4. Transfer the bytes
        if let Err(e) = self
            .storage
            .upload(&storage_key, body, size as u64, &content_type)
            .await
        {
            let err = AppError::from(e);
            tracing::warn!(
                error = %err,
                file_id = %file.id,
                storage_key = %storage_key,
                "Direct upload transfer failed; discarding staged record"
            );
            self.discard_staged(&file, &err).await;
            return Err(err);
        }

        // 5. Flip to completed inside a scoped transaction
        if let Err(err) = self.complete_in_transaction(file.id).await {
            tracing::warn!(
                error = %err,
                file_id = %file.id,
                storage_key = %storage_key,
                "Failed to mark direct upload completed; removing object"
            );
            self.remove_object(&file, &err).await;
            self.discard_staged(&file, &err).await;
            return Err(err);
        }

        tracing::info!(
            file_id = %file.id,
            storage_key = %storage_key,
            content_type = %content_type,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Direct upload completed"
        );

        Ok(File {
            status: FileStatus::Completed,
            updated_at: Utc::now(),
            ..file
        })
    }

    /// Presigned single-shot upload: stage a `pending` record and hand out a
    /// PUT URL bound to the resolved content type.
    #[tracing::instrument(skip(self), fields(file.operation = "init_presigned"))]
    pub async fn init_presigned_upload(
        &self,
        name: &str,
        declared_content_type: &str,
        size: i64,
    ) -> Result<PresignedUploadResult, AppError> {
        validate_new_upload(name, size)?;

        let content_type = mime::resolve_declared(name, declared_content_type);
        let storage_key = generate_storage_key(name, &content_type);
        let file = self
            .repo
            .create(NewFile::pending(name, size, &content_type, &storage_key))
            .await?;

        let upload_url = match self
            .storage
            .presign_upload_url(&storage_key, UPLOAD_URL_EXPIRY, &content_type)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                let err = AppError::from(e);
                self.discard_staged(&file, &err).await;
                return Err(err);
            }
        };

        tracing::info!(
            file_id = %file.id,
            storage_key = %storage_key,
            content_type = %content_type,
            "Presigned upload initiated"
        );

        Ok(PresignedUploadResult {
            file_id: file.id,
            upload_url,
            storage_key,
            content_type,
            expires_in: UPLOAD_URL_EXPIRY.as_secs(),
        })
    }

    /// Mark a presigned single-shot upload as done.
    ///
    /// The caller's word is trusted unless `verify_on_confirm` is set.
    /// Confirming an already completed file is a no-op.
    #[tracing::instrument(skip(self), fields(file.operation = "confirm", file_id = %id))]
    pub async fn confirm_upload(&self, id: Uuid) -> Result<File, AppError> {
        let mut file = self.repo.get_by_id(id).await?;

        if file.is_multipart() && !file.is_completed() {
            return Err(AppError::InvalidInput(format!(
                "File {} is a multipart upload; complete it instead",
                id
            )));
        }
        if !file.status.can_transition_to(FileStatus::Completed) {
            return Err(AppError::PreconditionFailed(format!(
                "File {} is {} and cannot be confirmed",
                id, file.status
            )));
        }
        if file.is_completed() {
            return Ok(file);
        }

        if self.verify_on_confirm {
            match self.storage.head(&file.storage_key).await? {
                None => {
                    return Err(AppError::PreconditionFailed(format!(
                        "Object for file {} has not been uploaded",
                        id
                    )))
                }
                Some(meta) if meta.size as i64 != file.size => {
                    tracing::warn!(
                        file_id = %id,
                        declared_size = file.size,
                        actual_size = meta.size,
                        "Uploaded object size differs from declared size"
                    );
                }
                Some(_) => {}
            }
        }

        self.repo.update_status(id, FileStatus::Completed).await?;
        file.status = FileStatus::Completed;
        file.updated_at = Utc::now();

        tracing::info!(file_id = %id, storage_key = %file.storage_key, "Presigned upload confirmed");
        Ok(file)
    }

    /// Open a multipart session and record it as `uploading`.
    #[tracing::instrument(skip(self), fields(file.operation = "init_multipart"))]
    pub async fn init_multipart_upload(
        &self,
        name: &str,
        declared_content_type: &str,
        size: i64,
    ) -> Result<MultipartUploadResult, AppError> {
        validate_new_upload(name, size)?;

        let content_type = mime::resolve_declared(name, declared_content_type);
        let storage_key = generate_storage_key(name, &content_type);

        let session = self
            .storage
            .init_multipart_upload(&storage_key, &content_type)
            .await?;

        let file = match self
            .repo
            .create(NewFile::uploading(
                name,
                size,
                &content_type,
                &storage_key,
                &session.upload_id,
            ))
            .await
        {
            Ok(file) => file,
            Err(err) => {
                if let Err(abort_err) = self
                    .storage
                    .abort_multipart_upload(&storage_key, &session.upload_id)
                    .await
                {
                    tracing::error!(
                        error = %err,
                        compensation_error = %abort_err,
                        storage_key = %storage_key,
                        upload_id = %session.upload_id,
                        "Failed to abort multipart session after record creation failed"
                    );
                }
                return Err(err);
            }
        };

        tracing::info!(
            file_id = %file.id,
            storage_key = %storage_key,
            upload_id = %session.upload_id,
            "Multipart upload initiated"
        );

        Ok(MultipartUploadResult {
            file_id: file.id,
            upload_id: session.upload_id,
            storage_key,
            content_type,
        })
    }

    /// Presigned URL for one part of an open multipart session.
    #[tracing::instrument(skip(self), fields(file.operation = "part_url", file_id = %id))]
    pub async fn part_upload_url(
        &self,
        id: Uuid,
        part_number: i32,
    ) -> Result<PartUploadUrl, AppError> {
        let file = self.repo.get_by_id(id).await?;
        if !file.is_multipart() {
            return Err(AppError::InvalidInput(format!(
                "File {} is not a multipart upload",
                id
            )));
        }
        validate_part_number(part_number)?;
        if file.status != FileStatus::Uploading {
            return Err(AppError::PreconditionFailed(format!(
                "Multipart upload for file {} is already {}",
                id, file.status
            )));
        }

        let url = self
            .storage
            .presign_part_url(
                &file.storage_key,
                &file.upload_id,
                part_number,
                UPLOAD_URL_EXPIRY,
            )
            .await?;

        tracing::debug!(file_id = %id, part_number, "Part upload URL issued");

        Ok(PartUploadUrl {
            file_id: id,
            part_number,
            url,
            expires_in: UPLOAD_URL_EXPIRY.as_secs(),
        })
    }

    /// Finalize a multipart session with the parts the uploader reports.
    #[tracing::instrument(skip(self, parts), fields(file.operation = "complete_multipart", file_id = %id, parts = parts.len()))]
    pub async fn complete_multipart_upload(
        &self,
        id: Uuid,
        parts: &[CompletedPart],
    ) -> Result<File, AppError> {
        let mut file = self.repo.get_by_id(id).await?;
        if !file.is_multipart() {
            return Err(AppError::InvalidInput(format!(
                "File {} is not a multipart upload",
                id
            )));
        }
        if file.status != FileStatus::Uploading {
            return Err(AppError::PreconditionFailed(format!(
                "Multipart upload for file {} is already {}",
                id, file.status
            )));
        }
        validate_parts(parts)?;

        self.storage
            .complete_multipart_upload(&file.storage_key, &file.upload_id, parts)
            .await?;

        if let Err(err) = self.repo.update_status(id, FileStatus::Completed).await {
            tracing::error!(
                error = %err,
                file_id = %id,
                storage_key = %file.storage_key,
                upload_id = %file.upload_id,
                "Multipart object assembled but record not marked completed"
            );
            return Err(err);
        }
        file.status = FileStatus::Completed;
        file.updated_at = Utc::now();

        tracing::info!(
            file_id = %id,
            storage_key = %file.storage_key,
            parts = parts.len(),
            "Multipart upload completed"
        );
        Ok(file)
    }

    /// Presigned GET URL for a completed file. `expires_in` defaults to 900s.
    #[tracing::instrument(skip(self), fields(file.operation = "download_url", file_id = %id))]
    pub async fn download_url(
        &self,
        id: Uuid,
        expires_in: Option<Duration>,
    ) -> Result<DownloadUrl, AppError> {
        let expires_in = expires_in.unwrap_or(DOWNLOAD_URL_EXPIRY);
        if expires_in < Duration::from_secs(1) || expires_in > MAX_PRESIGN_EXPIRY {
            return Err(AppError::InvalidInput(format!(
                "Download URL expiry must be between 1s and {}s",
                MAX_PRESIGN_EXPIRY.as_secs()
            )));
        }

        let file = self.ready_for_download(id).await?;
        let options = PresignOptions {
            content_type: Some(file.content_type.clone()),
            content_disposition: Some(disposition_type(&file.content_type).to_string()),
        };

        let url = self
            .storage
            .presign_download_url(&file.storage_key, expires_in, &options)
            .await?;

        Ok(DownloadUrl {
            file_id: id,
            url,
            expires_in: expires_in.as_secs(),
        })
    }

    /// Stream a completed file through this service.
    #[tracing::instrument(skip(self), fields(file.operation = "open_download", file_id = %id))]
    pub async fn open_download(&self, id: Uuid) -> Result<FileDownload, AppError> {
        let file = self.ready_for_download(id).await?;
        let object = self.storage.get_object(&file.storage_key).await?;

        Ok(FileDownload {
            content_length: object.content_length,
            content_type: file.content_type.clone(),
            content_disposition: disposition_header(&file),
            body: object.body,
            file,
        })
    }

    pub async fn get_file(&self, id: Uuid) -> Result<File, AppError> {
        self.repo.get_by_id(id).await
    }

    /// One page of live files, newest first. A zero limit means the default
    /// page size.
    pub async fn list_files(&self, offset: i64, limit: i64) -> Result<FileList, AppError> {
        if offset < 0 || limit < 0 {
            return Err(AppError::InvalidInput(
                "Offset and limit must be non-negative".to_string(),
            ));
        }
        let limit = if limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            limit.min(MAX_PAGE_SIZE)
        };

        let (files, total) = self.repo.list(offset, limit).await?;
        Ok(FileList {
            files,
            total,
            offset,
            limit,
        })
    }

    /// Delete the record and its object as one logical operation.
    ///
    /// The soft-delete is staged in a transaction; the object is removed
    /// before commit, and a failed removal rolls the record back.
    #[tracing::instrument(skip(self), fields(file.operation = "delete", file_id = %id))]
    pub async fn delete_file(&self, id: Uuid) -> Result<(), AppError> {
        let file = self.repo.get_by_id(id).await?;

        let mut tx = self.repo.begin().await?;
        tx.soft_delete(id).await?;

        if let Err(e) = self.storage.delete(&file.storage_key).await {
            let err = AppError::from(e);
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(
                    error = %err,
                    rollback_error = %rollback_err,
                    file_id = %id,
                    "Failed to rollback delete transaction"
                );
            }
            return Err(err);
        }

        if let Err(err) = tx.commit().await {
            tracing::error!(
                error = %err,
                file_id = %id,
                storage_key = %file.storage_key,
                "Object deleted but record deletion failed to commit; record is orphaned"
            );
            return Err(err);
        }

        // The session stays usable until the record is gone.
        if file.is_multipart() && file.status == FileStatus::Uploading {
            if let Err(e) = self
                .storage
                .abort_multipart_upload(&file.storage_key, &file.upload_id)
                .await
            {
                tracing::warn!(
                    error = %e,
                    file_id = %id,
                    upload_id = %file.upload_id,
                    "Failed to abort multipart session after delete"
                );
            }
        }

        tracing::info!(file_id = %id, storage_key = %file.storage_key, "File deleted");
        Ok(())
    }

    async fn ready_for_download(&self, id: Uuid) -> Result<File, AppError> {
        let file = self.repo.get_by_id(id).await?;
        if !file.is_completed() {
            return Err(AppError::PreconditionFailed(format!(
                "File {} is not ready for download (status: {})",
                id, file.status
            )));
        }
        Ok(file)
    }

    async fn complete_in_transaction(&self, id: Uuid) -> Result<(), AppError> {
        let mut tx = self.repo.begin().await?;
        if let Err(err) = tx.update_status(id, FileStatus::Completed).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(
                    error = %err,
                    rollback_error = %rollback_err,
                    file_id = %id,
                    "Failed to rollback status transaction"
                );
            }
            return Err(err);
        }
        tx.commit().await
    }

    /// Compensation: remove a staged record that never became durable.
    async fn discard_staged(&self, file: &File, cause: &AppError) {
        if let Err(purge_err) = self.repo.purge(file.id).await {
            tracing::error!(
                error = %cause,
                compensation_error = %purge_err,
                file_id = %file.id,
                storage_key = %file.storage_key,
                "Failed to purge staged record; record left pending"
            );
        }
    }

    /// Compensation: remove an object whose record could not be completed.
    async fn remove_object(&self, file: &File, cause: &AppError) {
        if let Err(delete_err) = self.storage.delete(&file.storage_key).await {
            tracing::error!(
                error = %cause,
                compensation_error = %delete_err,
                file_id = %file.id,
                storage_key = %file.storage_key,
                "Failed to delete object after record update failed; object orphaned"
            );
        }
    }
}
