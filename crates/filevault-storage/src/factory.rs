#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-oss")]
use crate::OssStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{Storage, StorageBackend, StorageError, StorageResult};
use filevault_core::Config;
use std::sync::Arc;

/// Create a storage backend based on configuration
pub async fn create_storage(config: &Config) -> StorageResult<Arc<dyn Storage>> {
    match config.storage_backend() {
        #[cfg(feature = "storage-s3")]
        StorageBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| StorageError::ConfigError("S3_BUCKET not configured".to_string()))?;

            let storage = S3Storage::new(s3).await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-s3"))]
        StorageBackend::S3 => Err(StorageError::ConfigError(
            "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-oss")]
        StorageBackend::Oss => {
            let oss = config.oss.as_ref().ok_or_else(|| {
                StorageError::ConfigError("OSS_ENDPOINT and OSS_BUCKET not configured".to_string())
            })?;

            let storage = OssStorage::new(oss).await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-oss"))]
        StorageBackend::Oss => Err(StorageError::ConfigError(
            "OSS storage backend not available (storage-oss feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-local")]
        StorageBackend::Local => {
            let local = config.local.as_ref().ok_or_else(|| {
                StorageError::ConfigError("LOCAL_STORAGE_PATH not configured".to_string())
            })?;

            let storage = LocalStorage::new(
                &local.base_path,
                local.base_url.clone(),
                local.signing_secret.clone(),
            )
            .await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-local"))]
        StorageBackend::Local => Err(StorageError::ConfigError(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        )),
    }
}
