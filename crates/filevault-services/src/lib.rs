//! Upload orchestration and background maintenance.
//!
//! `FileService` owns every consistency decision between the metadata store
//! and the storage backend. `ReconciliationService` sweeps records whose
//! out-of-band upload never happened.

pub mod file_service;
pub mod reconciliation;

pub use file_service::{
    DownloadUrl, FileDownload, FileList, FileService, MultipartUploadResult, PartUploadUrl,
    PresignedUploadResult,
};
pub use reconciliation::{
    MaxAgePolicy, NeverReap, ReconciliationPolicy, ReconciliationService, SweepReport,
};
