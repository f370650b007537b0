use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "sqlx")]
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Upload lifecycle of a file record.
///
/// `pending` is the entry state for direct and presigned single-shot uploads,
/// `uploading` for multipart sessions. Deletion is a soft-delete marker on the
/// record, not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "file_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    /// Forward-only transitions. `completed -> completed` is allowed so that a
    /// repeated confirm is idempotent.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Completed, Completed)
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "uploading" => Ok(FileStatus::Uploading),
            "completed" => Ok(FileStatus::Completed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(anyhow::anyhow!("Invalid file status: {}", other)),
        }
    }
}

/// A stored file. Bytes live in the storage backend under `storage_key`;
/// this record is the only durable metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
pub struct File {
    pub id: Uuid,
    pub name: String,
    pub size: i64,
    pub content_type: String,
    pub storage_key: String,
    pub status: FileStatus,
    pub hash: Option<String>,
    /// Backend multipart session token; empty unless opened via the multipart flow.
    pub upload_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl File {
    pub fn is_multipart(&self) -> bool {
        !self.upload_id.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.status == FileStatus::Completed
    }
}

/// Fields supplied when creating a record. Identity and timestamps are assigned
/// by the repository.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    pub size: i64,
    pub content_type: String,
    pub storage_key: String,
    pub status: FileStatus,
    pub upload_id: String,
}

impl NewFile {
    pub fn pending(name: &str, size: i64, content_type: &str, storage_key: &str) -> Self {
        Self {
            name: name.to_string(),
            size,
            content_type: content_type.to_string(),
            storage_key: storage_key.to_string(),
            status: FileStatus::Pending,
            upload_id: String::new(),
        }
    }

    pub fn uploading(
        name: &str,
        size: i64,
        content_type: &str,
        storage_key: &str,
        upload_id: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            size,
            content_type: content_type.to_string(),
            storage_key: storage_key.to_string(),
            status: FileStatus::Uploading,
            upload_id: upload_id.to_string(),
        }
    }

    /// Materialize into a full record with a fresh identity.
    pub fn into_file(self, now: DateTime<Utc>) -> File {
        File {
            id: Uuid::new_v4(),
            name: self.name,
            size: self.size,
            content_type: self.content_type,
            storage_key: self.storage_key,
            status: self.status,
            hash: None,
            upload_id: self.upload_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
