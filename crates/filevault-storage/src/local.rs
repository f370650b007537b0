use crate::keys::{validate_key, validate_part_number, validate_parts};
use crate::traits::{
    ByteReader, CompletedPart, MultipartUpload, ObjectMeta, ObjectStream, PresignOptions, Storage,
    StorageError, StorageResult,
};
use crate::StorageBackend;
use async_trait::async_trait;
use filevault_core::mime;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Staging area for multipart sessions, relative to the base path.
const MULTIPART_DIR: &str = ".multipart";
/// Records the key and content type a session was opened for.
const SESSION_FILE: &str = "session";
/// Write-time content types, mirroring the object layout.
const META_DIR: &str = ".meta";
const COPY_CHUNK: usize = 64 * 1024;

/// Operation bound into a local presigned URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOperation {
    Put,
    PutPart,
    Get,
}

impl LocalOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalOperation::Put => "put",
            LocalOperation::PutPart => "put_part",
            LocalOperation::Get => "get",
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

fn etag_of(hasher: Sha256) -> String {
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

fn same_etag(a: &str, b: &str) -> bool {
    a.trim_matches('"') == b.trim_matches('"')
}

/// Local filesystem storage implementation
///
/// Presigned URLs point at `base_url` and carry an HMAC-SHA256 signature over
/// the operation, key, expiry and operation-specific parameters; whatever
/// serves `base_url` checks them with [`LocalStorage::verify_signature`].
/// Multipart sessions are staged under `.multipart/{upload_id}/` and
/// concatenated on completion. The content type given at write time is kept
/// under `.meta/{key}` and reported by `head` and `get_object`.
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: String,
    signing_key: Vec<u8>,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/filevault")
    /// * `base_url` - Base URL for serving files (e.g., "http://localhost:8080/files")
    /// * `signing_secret` - HMAC key for presigned URLs; random when `None`
    pub async fn new(
        base_path: impl Into<PathBuf>,
        base_url: String,
        signing_secret: Option<String>,
    ) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(base_path.join(MULTIPART_DIR))
            .await
            .map_err(|e| {
                StorageError::ConfigError(format!(
                    "Failed to create storage directory {}: {}",
                    base_path.display(),
                    e
                ))
            })?;

        let signing_key = match signing_secret {
            Some(secret) => secret.into_bytes(),
            None => {
                use rand::Rng;
                tracing::warn!(
                    "LOCAL_STORAGE_SIGNING_SECRET not set; presigned URLs will not survive a restart"
                );
                let mut rng = rand::rng();
                (0..32).map(|_| rng.random::<u8>()).collect()
            }
        };

        Ok(LocalStorage {
            base_path,
            base_url,
            signing_key,
        })
    }

    /// Convert storage key to filesystem path with security validation
    ///
    /// Keys may not contain traversal sequences, and may not reach into the
    /// reserved staging or metadata areas.
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        validate_key(storage_key)?;
        if matches!(storage_key.split('/').next(), Some(MULTIPART_DIR | META_DIR)) {
            return Err(StorageError::InvalidKey(
                "Storage key addresses a reserved directory".to_string(),
            ));
        }

        let path = self.base_path.join(storage_key);
        if !path.starts_with(&self.base_path) {
            return Err(StorageError::InvalidKey(
                "Storage key resolves outside storage directory".to_string(),
            ));
        }

        Ok(path)
    }

    fn session_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidMultipart(format!(
                "Malformed upload id: {}",
                upload_id
            )));
        }
        Ok(self.base_path.join(MULTIPART_DIR).join(upload_id))
    }

    fn part_path(dir: &Path, part_number: i32) -> PathBuf {
        dir.join(format!("{:05}.part", part_number))
    }

    /// Load the session and check it belongs to `key`. Returns the staging
    /// directory and the content type the session was opened with.
    async fn open_session(&self, key: &str, upload_id: &str) -> StorageResult<(PathBuf, String)> {
        let dir = self.session_dir(upload_id)?;
        let session = fs::read_to_string(dir.join(SESSION_FILE))
            .await
            .map_err(|_| {
                StorageError::InvalidMultipart(format!("Unknown upload id: {}", upload_id))
            })?;

        let mut lines = session.lines();
        match lines.next() {
            Some(session_key) if session_key == key => {
                let content_type = lines.next().unwrap_or_default().to_string();
                Ok((dir, content_type))
            }
            _ => Err(StorageError::InvalidMultipart(format!(
                "Upload {} does not belong to key {}",
                upload_id, key
            ))),
        }
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.base_path.join(META_DIR).join(key)
    }

    async fn write_content_type(&self, key: &str, content_type: &str) -> StorageResult<()> {
        let path = self.meta_path(key);
        self.ensure_parent_dir(&path).await?;
        fs::write(&path, content_type).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to record content type for {}: {}",
                key, e
            ))
        })
    }

    /// Falls back to the key extension for objects written without a type.
    async fn read_content_type(&self, key: &str) -> String {
        match fs::read_to_string(self.meta_path(key)).await {
            Ok(content_type) if !content_type.trim().is_empty() => {
                content_type.trim().to_string()
            }
            _ => mime::resolve_from_name(key).to_string(),
        }
    }

    fn signature(&self, op: LocalOperation, key: &str, expires: u64, params: &str) -> String {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(&self.signing_key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(format!("{}\n{}\n{}\n{}", op.as_str(), key, expires, params).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_url(
        &self,
        op: LocalOperation,
        key: &str,
        expires_in: Duration,
        params: &[(&str, &str)],
    ) -> String {
        let expires = unix_now() + expires_in.as_secs();
        let canonical = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.signature(op, key, expires, &canonical);

        let mut url = format!(
            "{}/{}?op={}&expires={}",
            self.base_url.trim_end_matches('/'),
            key,
            op.as_str(),
            expires
        );
        if !canonical.is_empty() {
            url.push('&');
            url.push_str(&canonical);
        }
        url.push_str("&signature=");
        url.push_str(&signature);
        url
    }

    /// Check a presigned request.
    ///
    /// `params` are the operation parameters in the order they appear in the
    /// URL, already percent-decoded.
    pub fn verify_signature(
        &self,
        op: LocalOperation,
        key: &str,
        expires: u64,
        params: &[(&str, &str)],
        signature: &str,
    ) -> bool {
        if expires < unix_now() {
            tracing::debug!(key = %key, "Local presigned URL expired");
            return false;
        }

        let canonical = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let expected = self.signature(op, key, expires, &canonical);

        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }

    /// Store one part of an open multipart session and return its ETag.
    ///
    /// This is the server side of a presigned part URL.
    pub async fn put_part(
        &self,
        upload_id: &str,
        part_number: i32,
        mut reader: ByteReader,
    ) -> StorageResult<String> {
        validate_part_number(part_number)?;
        let dir = self.session_dir(upload_id)?;
        if !fs::try_exists(dir.join(SESSION_FILE)).await.unwrap_or(false) {
            return Err(StorageError::InvalidMultipart(format!(
                "Unknown upload id: {}",
                upload_id
            )));
        }

        let path = Self::part_path(&dir, part_number);
        let mut file = fs::File::create(&path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create part {}: {}", path.display(), e))
        })?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to read part stream: {}", e))
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        file.sync_all().await?;

        tracing::debug!(
            upload_id = %upload_id,
            part_number,
            size_bytes = size,
            "Local multipart part stored"
        );

        Ok(etag_of(hasher))
    }

    /// Ensure parent directory exists
    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".partial-{}", Uuid::new_v4().simple()));
        path.with_file_name(name)
    }

    /// Write through a temp file and rename, so a failed transfer never leaves
    /// a truncated object behind.
    async fn write_atomically(
        &self,
        key: &str,
        path: &Path,
        mut reader: ByteReader,
        content_type: &str,
    ) -> StorageResult<u64> {
        self.ensure_parent_dir(path).await?;
        let tmp = Self::temp_path(path);

        let result = async {
            let mut file = fs::File::create(&tmp).await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to create file {}: {}", tmp.display(), e))
            })?;
            let copied = tokio::io::copy(&mut reader, &mut file).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to write stream to file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            file.sync_all().await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to sync file {}: {}", path.display(), e))
            })?;
            self.write_content_type(key, content_type).await?;
            fs::rename(&tmp, path).await?;
            Ok::<_, StorageError>(copied)
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(
        &self,
        key: &str,
        reader: ByteReader,
        _size: u64,
        content_type: &str,
    ) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        let start = std::time::Instant::now();

        let size = self
            .write_atomically(key, &path, reader, content_type)
            .await?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(())
    }

    async fn presign_upload_url(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: &str,
    ) -> StorageResult<String> {
        self.key_to_path(key)?;
        Ok(self.signed_url(
            LocalOperation::Put,
            key,
            expires_in,
            &[("content_type", content_type)],
        ))
    }

    async fn init_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> StorageResult<MultipartUpload> {
        self.key_to_path(key)?;

        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.session_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        fs::write(
            dir.join(SESSION_FILE),
            format!("{}\n{}\n", key, content_type),
        )
        .await?;

        tracing::debug!(key = %key, upload_id = %upload_id, "Local multipart upload initiated");

        Ok(MultipartUpload {
            upload_id,
            key: key.to_string(),
        })
    }

    async fn presign_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.key_to_path(key)?;
        validate_part_number(part_number)?;
        self.open_session(key, upload_id).await?;

        let part = part_number.to_string();
        Ok(self.signed_url(
            LocalOperation::PutPart,
            key,
            expires_in,
            &[("upload_id", upload_id), ("part_number", &part)],
        ))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        validate_parts(parts)?;
        let (dir, content_type) = self.open_session(key, upload_id).await?;
        let start = std::time::Instant::now();

        self.ensure_parent_dir(&path).await?;
        let tmp = Self::temp_path(&path);

        let result = async {
            let mut out = fs::File::create(&tmp).await?;
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut total = 0u64;

            for part in parts {
                let part_path = Self::part_path(&dir, part.part_number);
                let mut input = fs::File::open(&part_path).await.map_err(|_| {
                    StorageError::InvalidMultipart(format!(
                        "Part {} was never uploaded",
                        part.part_number
                    ))
                })?;

                let mut hasher = Sha256::new();
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                    total += n as u64;
                }

                if !same_etag(&etag_of(hasher), &part.etag) {
                    return Err(StorageError::InvalidMultipart(format!(
                        "ETag mismatch for part {}",
                        part.part_number
                    )));
                }
            }

            out.sync_all().await?;
            self.write_content_type(key, &content_type).await?;
            fs::rename(&tmp, &path).await?;
            Ok::<_, StorageError>(total)
        }
        .await;

        let total = match result {
            Ok(total) => total,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!(error = %e, upload_id = %upload_id, "Failed to remove multipart staging directory");
        }

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = total,
            parts = parts.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local multipart upload completed"
        );

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.key_to_path(key)?;
        let dir = self.session_dir(upload_id)?;

        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(());
        }
        fs::remove_dir_all(&dir).await.map_err(|e| {
            StorageError::DeleteFailed(format!("Failed to remove session {}: {}", upload_id, e))
        })?;

        tracing::debug!(key = %key, upload_id = %upload_id, "Local multipart upload aborted");
        Ok(())
    }

    async fn presign_download_url(
        &self,
        key: &str,
        expires_in: Duration,
        options: &PresignOptions,
    ) -> StorageResult<String> {
        self.key_to_path(key)?;

        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(ref content_type) = options.content_type {
            params.push(("content_type", content_type));
        }
        if let Some(ref disposition) = options.content_disposition {
            params.push(("content_disposition", disposition));
        }

        Ok(self.signed_url(LocalOperation::Get, key, expires_in, &params))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        let start = std::time::Instant::now();

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        fs::remove_file(&path).await.map_err(|e| {
            StorageError::DeleteFailed(format!("Failed to delete file {}: {}", path.display(), e))
        })?;
        if let Err(e) = fs::remove_file(self.meta_path(key)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, key = %key, "Failed to remove content type record");
            }
        }

        tracing::info!(
            path = %path.display(),
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let path = self.key_to_path(key)?;

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                size: meta.len(),
                content_type: Some(self.read_content_type(key).await),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn get_object(&self, key: &str) -> StorageResult<ObjectStream> {
        let path = self.key_to_path(key)?;
        let start = std::time::Instant::now();

        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => {
                return Err(StorageError::DownloadFailed(format!(
                    "Failed to open file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let content_length = file.metadata().await.ok().map(|m| m.len());
        let content_type = self.read_content_type(key).await;

        let key_owned = key.to_string();
        let path_display = path.display().to_string();
        let stream = tokio_util::io::ReaderStream::new(file).map(move |item| {
            item.map_err(|e| {
                tracing::error!(
                    path = %path_display,
                    key = %key_owned,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Local storage stream download error"
                );
                StorageError::DownloadFailed(format!("Failed to read chunk: {}", e))
            })
        });

        Ok(ObjectStream {
            body: Box::pin(stream),
            content_type: Some(content_type),
            content_length,
        })
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}
