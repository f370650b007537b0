use crate::keys::{validate_key, validate_part_number, validate_parts};
use crate::traits::{
    ByteReader, CompletedPart, MultipartUpload, ObjectMeta, ObjectStream, PresignOptions, Storage,
    StorageError, StorageResult,
};
use crate::StorageBackend;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{
    Credentials, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use filevault_core::S3Config;
use futures::StreamExt;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

/// Parts used when a proxied upload is too large for a single PUT. S3 requires
/// at least 5 MiB for every part except the last.
const UPLOAD_PART_SIZE: usize = 8 * 1024 * 1024;

/// Connection settings shared by the S3 and OSS backends.
pub(crate) struct ClientSettings {
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub credentials: Option<(String, String)>,
}

/// Build an S3 client. Retries are disabled: every backend call is attempted
/// once and failures surface to the orchestrator.
pub(crate) async fn build_client(settings: ClientSettings) -> Client {
    let shared = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.region.clone()))
        .retry_config(RetryConfig::standard().with_max_attempts(1))
        .load()
        .await;

    let mut builder =
        aws_sdk_s3::config::Builder::from(&shared).force_path_style(settings.force_path_style);

    if let Some(endpoint) = settings.endpoint {
        // S3-compatible providers reject the SDK's default flexible checksums.
        builder = builder
            .endpoint_url(endpoint)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired);
    }

    if let Some((access_key_id, secret)) = settings.credentials {
        builder = builder.credentials_provider(Credentials::new(
            access_key_id,
            secret,
            None,
            None,
            "filevault-static",
        ));
    }

    Client::from_conf(builder.build())
}

fn presigning_config(expires_in: Duration) -> StorageResult<PresigningConfig> {
    PresigningConfig::builder()
        .expires_in(expires_in)
        .build()
        .map_err(|e| StorageError::PresignFailed(e.to_string()))
}

fn service_code<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> Option<&str> {
    match err {
        SdkError::ServiceError(service_err) => service_err.err().code(),
        _ => None,
    }
}

/// S3 storage implementation
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    backend: StorageBackend,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// With `endpoint` set the client targets an S3-compatible provider
    /// (e.g. "http://localhost:9000" for MinIO); `use_path_style` selects
    /// `{endpoint}/{bucket}/{key}` addressing over virtual-hosted buckets.
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::ConfigError(
                "S3_BUCKET not configured".to_string(),
            ));
        }

        let credentials = match (&config.access_key_id, &config.secret_access_key) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            _ => None,
        };

        let client = build_client(ClientSettings {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            force_path_style: config.use_path_style,
            credentials,
        })
        .await;

        tracing::info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            path_style = config.use_path_style,
            "S3 storage initialized"
        );

        Ok(Self::from_client(client, config.bucket.clone(), StorageBackend::S3))
    }

    pub(crate) fn from_client(client: Client, bucket: String, backend: StorageBackend) -> Self {
        S3Storage {
            client,
            bucket,
            backend,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Read up to `buf.len()` bytes, stopping early only at EOF.
    async fn fill_buffer(reader: &mut ByteReader, buf: &mut [u8]) -> StorageResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to read from stream: {}", e))
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn put_single(&self, key: &str, body: Bytes, content_type: &str) -> StorageResult<()> {
        let size = body.len();
        let start = std::time::Instant::now();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(S3ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                StorageError::UploadFailed(e.to_string())
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(())
    }

    /// Stream the remainder of `reader` as a server-side multipart upload,
    /// starting with an already-read first part.
    async fn put_multipart(
        &self,
        key: &str,
        first_part: Bytes,
        mut reader: ByteReader,
        content_type: &str,
    ) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let session = self.init_multipart_upload(key, content_type).await?;

        let result = async {
            let mut parts = Vec::new();
            let mut part_number = 1i32;
            let mut total_size = 0u64;
            let mut body = first_part;
            let mut buffer = vec![0u8; UPLOAD_PART_SIZE];

            loop {
                total_size += body.len() as u64;
                let output = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&session.upload_id)
                    .part_number(part_number)
                    .body(S3ByteStream::from(body))
                    .send()
                    .await
                    .map_err(|e| {
                        tracing::error!(
                            error = %e,
                            bucket = %self.bucket,
                            key = %key,
                            part_number,
                            "Failed to upload part"
                        );
                        StorageError::UploadFailed(e.to_string())
                    })?;

                let etag = output.e_tag().ok_or_else(|| {
                    StorageError::UploadFailed(format!("No ETag returned for part {}", part_number))
                })?;
                parts.push(CompletedPart {
                    part_number,
                    etag: etag.to_string(),
                });

                let read = Self::fill_buffer(&mut reader, &mut buffer).await?;
                if read == 0 {
                    break;
                }
                body = Bytes::copy_from_slice(&buffer[..read]);
                part_number += 1;
            }

            self.complete_multipart_upload(key, &session.upload_id, &parts)
                .await?;
            Ok::<_, StorageError>((parts.len(), total_size))
        }
        .await;

        match result {
            Ok((parts, total_size)) => {
                tracing::info!(
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = total_size,
                    parts,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 multipart stream upload successful"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self.abort_multipart_upload(key, &session.upload_id).await
                {
                    tracing::error!(
                        error = %abort_err,
                        key = %key,
                        upload_id = %session.upload_id,
                        "Failed to abort multipart upload after stream failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Presigned GET with explicit override handling; OSS passes
    /// `allow_content_type = false`.
    pub(crate) async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        options: &PresignOptions,
        allow_content_type: bool,
    ) -> StorageResult<String> {
        validate_key(key)?;

        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if allow_content_type {
            if let Some(ref content_type) = options.content_type {
                request = request.response_content_type(content_type);
            }
        }
        if let Some(ref disposition) = options.content_disposition {
            request = request.response_content_disposition(disposition);
        }

        let presigned = request
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn upload(
        &self,
        key: &str,
        mut reader: ByteReader,
        size: u64,
        content_type: &str,
    ) -> StorageResult<()> {
        validate_key(key)?;

        // Small payloads go out as one PUT; larger ones are streamed part by
        // part so memory stays bounded at one part.
        let mut buffer = Vec::with_capacity((size as usize).min(UPLOAD_PART_SIZE));
        (&mut reader)
            .take(UPLOAD_PART_SIZE as u64)
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| StorageError::UploadFailed(format!("Failed to read from stream: {}", e)))?;

        if buffer.len() < UPLOAD_PART_SIZE {
            return self.put_single(key, Bytes::from(buffer), content_type).await;
        }

        self.put_multipart(key, Bytes::from(buffer), reader, content_type)
            .await
    }

    async fn presign_upload_url(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: &str,
    ) -> StorageResult<String> {
        validate_key(key)?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn init_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> StorageResult<MultipartUpload> {
        validate_key(key)?;

        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    "Failed to create multipart upload"
                );
                StorageError::BackendError(e.to_string())
            })?;

        let upload_id = output.upload_id().ok_or_else(|| {
            StorageError::BackendError("No upload ID returned from backend".to_string())
        })?;

        tracing::debug!(bucket = %self.bucket, key = %key, upload_id = %upload_id, "Multipart upload initiated");

        Ok(MultipartUpload {
            upload_id: upload_id.to_string(),
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
        validate_key(key)?;
        validate_part_number(part_number)?;

        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        validate_key(key)?;
        validate_parts(parts)?;
        let start = std::time::Instant::now();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        S3CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(&part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    upload_id = %upload_id,
                    "Failed to complete multipart upload"
                );
                match service_code(&e) {
                    Some("InvalidPart") | Some("InvalidPartOrder") | Some("NoSuchUpload")
                    | Some("EntityTooSmall") => StorageError::InvalidMultipart(e.to_string()),
                    _ => StorageError::UploadFailed(e.to_string()),
                }
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            parts = parts.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Multipart upload completed"
        );

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        validate_key(key)?;

        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if service_code(&e) == Some("NoSuchUpload") => Ok(()),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn presign_download_url(
        &self,
        key: &str,
        expires_in: Duration,
        options: &PresignOptions,
    ) -> StorageResult<String> {
        self.presign_get(key, expires_in, options, true).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let start = std::time::Instant::now();

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                StorageError::DeleteFailed(e.to_string())
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        validate_key(key)?;

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                size: output.content_length().unwrap_or_default().max(0) as u64,
                content_type: output.content_type().map(String::from),
            })),
            Err(e) => match &e {
                SdkError::ServiceError(service_err) => match service_err.err() {
                    HeadObjectError::NotFound(_) => Ok(None),
                    _ => Err(StorageError::BackendError(e.to_string())),
                },
                _ => Err(StorageError::BackendError(e.to_string())),
            },
        }
    }

    async fn get_object(&self, key: &str) -> StorageResult<ObjectStream> {
        validate_key(key)?;
        let start = std::time::Instant::now();

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err) => match service_err.err() {
                    GetObjectError::NoSuchKey(_) => StorageError::NotFound(key.to_string()),
                    _ => StorageError::DownloadFailed(e.to_string()),
                },
                _ => StorageError::DownloadFailed(e.to_string()),
            })?;

        let content_type = response.content_type().map(String::from);
        let content_length = response.content_length().map(|len| len.max(0) as u64);

        let bucket = self.bucket.clone();
        let key = key.to_string();
        let stream = ReaderStream::new(response.body.into_async_read()).map(move |item| {
            item.map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 stream download error"
                );
                StorageError::DownloadFailed(e.to_string())
            })
        });

        Ok(ObjectStream {
            body: Box::pin(stream),
            content_type,
            content_length,
        })
    }

    fn backend_type(&self) -> StorageBackend {
        self.backend
    }
}
