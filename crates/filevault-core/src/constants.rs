//! Contract constants shared by the orchestrator and its callers.

use std::time::Duration;

/// Lifetime of presigned single-shot and part upload URLs.
pub const UPLOAD_URL_EXPIRY: Duration = Duration::from_secs(3600);

/// Default lifetime of presigned download URLs.
pub const DOWNLOAD_URL_EXPIRY: Duration = Duration::from_secs(900);

/// Longest expiry a caller may request for a download URL (SigV4 ceiling).
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Bytes inspected when sniffing the content type of a direct upload.
pub const SNIFF_WINDOW: usize = 512;

/// Multipart part numbers accepted by every backend.
pub const MIN_PART_NUMBER: i32 = 1;
pub const MAX_PART_NUMBER: i32 = 10_000;

/// Default page size for `list_files` when the caller passes 0.
pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 1000;
