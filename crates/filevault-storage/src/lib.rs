//! FileVault Storage Library
//!
//! Storage abstraction and backend implementations: AWS S3 (and S3-compatible
//! services such as MinIO), Alibaba Cloud OSS, and the local filesystem.
//!
//! # Storage key format
//!
//! All backends share one key layout, `files/{unix_seconds}/{uuid}{ext}`.
//! Keys must not contain `..` or a leading `/`. Key generation is centralized
//! in the `keys` module so all backends stay consistent.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-oss")]
pub mod oss;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use factory::create_storage;
pub use filevault_core::StorageBackend;
pub use keys::generate_storage_key;
#[cfg(feature = "storage-local")]
pub use local::{LocalOperation, LocalStorage};
#[cfg(feature = "storage-oss")]
pub use oss::OssStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{
    ByteReader, ByteStream, CompletedPart, MultipartUpload, ObjectMeta, ObjectStream,
    PresignOptions, Storage, StorageError, StorageResult,
};
