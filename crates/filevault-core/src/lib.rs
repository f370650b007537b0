//! filevault core library
//!
//! Domain model, error taxonomy, configuration and the MIME resolver shared by
//! the storage, database and service crates.

pub mod config;
pub mod constants;
pub mod error;
pub mod mime;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use config::{Config, LocalStorageConfig, OssConfig, ReconcileConfig, S3Config};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use models::{File, FileStatus, NewFile};
pub use storage_types::StorageBackend;
