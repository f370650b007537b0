//! Shared key generation and validation for storage backends.
//!
//! Key format: `files/{unix_seconds}/{uuid}{ext}`. The extension comes from the
//! file name when it has a usable one and from the content type otherwise, so
//! every key ends in an extension.

use crate::traits::{CompletedPart, StorageError, StorageResult};
use filevault_core::constants::{MAX_PART_NUMBER, MIN_PART_NUMBER};
use filevault_core::mime;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const KEY_PREFIX: &str = "files";
const MAX_EXTENSION_LEN: usize = 16;

fn usable_extension(name: &str) -> Option<String> {
    let ext = mime::extension_of(name);
    let body = ext.strip_prefix('.')?;
    if body.is_empty()
        || body.len() > MAX_EXTENSION_LEN
        || !body.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext)
}

/// Mint a fresh storage key for a file.
pub fn generate_storage_key(name: &str, content_type: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let ext = usable_extension(name)
        .unwrap_or_else(|| mime::reverse_to_extension(content_type).to_string());

    format!(
        "{}/{}/{}{}",
        KEY_PREFIX,
        timestamp,
        Uuid::new_v4().simple(),
        ext
    )
}

/// Reject keys that could escape a backend's namespace.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.contains("..") || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_part_number(part_number: i32) -> StorageResult<()> {
    if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
        return Err(StorageError::InvalidMultipart(format!(
            "Part number {} outside {}..={}",
            part_number, MIN_PART_NUMBER, MAX_PART_NUMBER
        )));
    }
    Ok(())
}

/// Parts must be non-empty, carry ETags and be in strictly ascending order.
pub fn validate_parts(parts: &[CompletedPart]) -> StorageResult<()> {
    if parts.is_empty() {
        return Err(StorageError::InvalidMultipart(
            "At least one part is required".to_string(),
        ));
    }

    let mut previous = 0;
    for part in parts {
        validate_part_number(part.part_number)?;
        if part.part_number <= previous {
            return Err(StorageError::InvalidMultipart(format!(
                "Part {} is out of order or duplicated",
                part.part_number
            )));
        }
        if part.etag.trim().is_empty() {
            return Err(StorageError::InvalidMultipart(format!(
                "Part {} has no ETag",
                part.part_number
            )));
        }
        previous = part.part_number;
    }
    Ok(())
}
