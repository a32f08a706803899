//! File records and the projections derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

/// Metadata of a single file.
///
/// `is_uploaded == false` means the content object under
/// [`content_key`] is missing or not yet final.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub bucket_id: String,
    /// Quoted content hash, ready to be used as an `ETag` header value.
    pub etag: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_uploaded: bool,
    pub mime_type: String,
    pub uploaded_by_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl FileMetadata {
    pub fn content_key(&self) -> String {
        content_key(&self.bucket_id, &self.id)
    }
}

/// Final values written when a file transitions to "uploaded".
#[derive(Clone, Debug, PartialEq)]
pub struct FileUpdate {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub bucket_id: String,
    pub etag: String,
    pub is_uploaded: bool,
    pub mime_type: String,
    pub metadata: Option<Map<String, Value>>,
}

/// Projection used by reconciliation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub bucket_id: String,
    pub is_uploaded: bool,
}

impl FileSummary {
    pub fn content_key(&self) -> String {
        content_key(&self.bucket_id, &self.id)
    }
}

impl From<&FileMetadata> for FileSummary {
    fn from(file: &FileMetadata) -> Self {
        Self {
            id: file.id.clone(),
            name: file.name.clone(),
            bucket_id: file.bucket_id.clone(),
            is_uploaded: file.is_uploaded,
        }
    }
}

/// Key of a file's content object: `{bucketId}/{fileId}`.
pub fn content_key(bucket_id: &str, file_id: &str) -> String {
    format!("{}/{}", bucket_id, file_id)
}
