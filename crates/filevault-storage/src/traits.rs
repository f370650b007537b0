//! Storage abstraction trait
//!
//! This module defines the capability contract every backend implements. The
//! orchestrator is written against `Storage` only; vendor differences
//! (addressing style, presigning rules, multipart semantics) stay inside the
//! implementations.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use filevault_core::AppError;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Invalid multipart request: {0}")]
    InvalidMultipart(String),

    #[error("Presign failed: {0}")]
    PresignFailed(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Backend failures are upstream failures, except requests the caller got
/// wrong (bad key, bad part list).
impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidKey(_) | StorageError::InvalidMultipart(_) => {
                AppError::InvalidInput(err.to_string())
            }
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Reader consumed by `Storage::upload`.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Chunked object body returned by `Storage::get_object`.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Response overrides for presigned downloads.
///
/// Not every backend can override the stored content type; all of them honour
/// the disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresignOptions {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

/// An open multipart session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub key: String,
}

/// A part as reported by the uploader: its number and the ETag the backend
/// returned for its transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Result of a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub content_type: Option<String>,
}

/// An object opened for streaming.
pub struct ObjectStream {
    pub body: ByteStream,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Storage abstraction trait
///
/// All backends (S3, OSS, local filesystem) implement this trait with the
/// same externally observable semantics. Keys are produced by
/// [`crate::generate_storage_key`] and never contain `..` or a leading `/`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Transfer the full reader to `key`, setting the content type at write
    /// time. `size` is the caller's declaration and is advisory only.
    async fn upload(
        &self,
        key: &str,
        reader: ByteReader,
        size: u64,
        content_type: &str,
    ) -> StorageResult<()>;

    /// Presigned single-shot PUT URL. The uploader must send exactly
    /// `content_type`, since some backends sign it.
    async fn presign_upload_url(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: &str,
    ) -> StorageResult<String>;

    /// Open a multipart session.
    async fn init_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> StorageResult<MultipartUpload>;

    /// Presigned URL for uploading part `part_number` (1-based).
    async fn presign_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// Finalize a multipart session. The backend validates part contiguity
    /// and ETags.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    /// Abandon a multipart session and release its parts. Aborting an
    /// unknown session is not an error.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Presigned GET URL.
    async fn presign_download_url(
        &self,
        key: &str,
        expires_in: Duration,
        options: &PresignOptions,
    ) -> StorageResult<String>;

    /// Remove an object. Deleting a nonexistent key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Object metadata, or `None` when the key does not exist.
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Open an object for streaming.
    async fn get_object(&self, key: &str) -> StorageResult<ObjectStream>;

    /// Get the storage backend type (diagnostics only)
    fn backend_type(&self) -> StorageBackend;
}
