//! Alibaba Cloud OSS backend.
//!
//! OSS is driven through its S3-compatible API with virtual-hosted bucket
//! addressing (OSS rejects path-style requests). Two vendor rules differ from
//! S3 and are handled here:
//!
//! - the region is derived from the `oss-{region}.aliyuncs.com` endpoint
//! - presigned downloads cannot override the stored content type, so only the
//!   disposition is forwarded

use crate::s3::{build_client, ClientSettings, S3Storage};
use crate::traits::{
    ByteReader, CompletedPart, MultipartUpload, ObjectMeta, ObjectStream, PresignOptions, Storage,
    StorageError, StorageResult,
};
use crate::StorageBackend;
use async_trait::async_trait;
use filevault_core::OssConfig;
use std::time::Duration;

#[derive(Clone)]
pub struct OssStorage {
    inner: S3Storage,
    region: String,
}

impl OssStorage {
    pub async fn new(config: &OssConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::ConfigError(
                "OSS_BUCKET not configured".to_string(),
            ));
        }
        if config.endpoint.is_empty() {
            return Err(StorageError::ConfigError(
                "OSS_ENDPOINT not configured".to_string(),
            ));
        }

        let region = config.region();
        let client = build_client(ClientSettings {
            region: region.clone(),
            endpoint: Some(config.endpoint_url()),
            force_path_style: false,
            credentials: Some((
                config.access_key_id.clone(),
                config.access_key_secret.clone(),
            )),
        })
        .await;

        tracing::info!(
            bucket = %config.bucket,
            region = %region,
            endpoint = %config.endpoint,
            "OSS storage initialized"
        );

        Ok(OssStorage {
            inner: S3Storage::from_client(client, config.bucket.clone(), StorageBackend::Oss),
            region,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl Storage for OssStorage {
    async fn upload(
        &self,
        key: &str,
        reader: ByteReader,
        size: u64,
        content_type: &str,
    ) -> StorageResult<()> {
        self.inner.upload(key, reader, size, content_type).await
    }

    async fn presign_upload_url(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: &str,
    ) -> StorageResult<String> {
        self.inner
            .presign_upload_url(key, expires_in, content_type)
            .await
    }

    async fn init_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> StorageResult<MultipartUpload> {
        self.inner.init_multipart_upload(key, content_type).await
    }

    async fn presign_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.inner
            .presign_part_url(key, upload_id, part_number, expires_in)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }

    async fn presign_download_url(
        &self,
        key: &str,
        expires_in: Duration,
        options: &PresignOptions,
    ) -> StorageResult<String> {
        self.inner.presign_get(key, expires_in, options, false).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        self.inner.head(key).await
    }

    async fn get_object(&self, key: &str) -> StorageResult<ObjectStream> {
        self.inner.get_object(key).await
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Oss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn shanghai() -> OssStorage {
        OssStorage::new(&OssConfig {
            endpoint: "oss-cn-shanghai.aliyuncs.com".to_string(),
            bucket: "assets".to_string(),
            access_key_id: "LTAI-example".to_string(),
            access_key_secret: "secret".to_string(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_virtual_hosted_addressing() {
        let storage = shanghai().await;
        assert_eq!(storage.region(), "cn-shanghai");

        let url = storage
            .presign_upload_url("files/1/a.txt", Duration::from_secs(3600), "text/plain")
            .await
            .unwrap();
        assert!(url.starts_with("https://assets.oss-cn-shanghai.aliyuncs.com/files/1/a.txt?"));
    }

    #[tokio::test]
    async fn test_download_keeps_disposition_only() {
        let storage = shanghai().await;
        let options = PresignOptions {
            content_type: Some("image/png".to_string()),
            content_disposition: Some("attachment".to_string()),
        };
        let url = storage
            .presign_download_url("files/1/a.png", Duration::from_secs(900), &options)
            .await
            .unwrap();

        assert!(!url.contains("response-content-type"));
        assert!(url.contains("response-content-disposition=attachment"));
        assert_eq!(storage.backend_type(), StorageBackend::Oss);
    }

    #[tokio::test]
    async fn test_missing_bucket_is_config_error() {
        let result = OssStorage::new(&OssConfig {
            endpoint: "oss-cn-hangzhou.aliyuncs.com".to_string(),
            bucket: String::new(),
            access_key_id: "id".to_string(),
            access_key_secret: "secret".to_string(),
        })
        .await;
        assert!(matches!(result, Err(StorageError::ConfigError(_))));
    }
}
