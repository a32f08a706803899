//! Bucket settings that govern uploads and reads of the files inside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::Duration;

/// A bucket record owned by the metadata store.
///
/// Read once per request and never modified by the gateway.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetadata {
    pub id: String,

    /// Smallest accepted file size in bytes (inclusive).
    #[serde(rename = "minUploadFile")]
    pub min_upload_file_size: i64,

    /// Largest accepted file size in bytes (inclusive).
    #[serde(rename = "maxUploadFile")]
    pub max_upload_file_size: i64,

    #[serde(rename = "presignedURLsEnabled")]
    pub presigned_urls_enabled: bool,

    /// Lifetime of presigned URLs, in minutes.
    pub download_expiration: i64,

    /// Value emitted as `Cache-Control` on reads.
    pub cache_control: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BucketMetadata {
    pub fn download_expiration(&self) -> Duration {
        Duration::from_secs(self.download_expiration.max(0) as u64 * 60)
    }
}
