//! Metadata store: file and bucket records.
//!
//! `SqliteMetadataStore` keeps both in SQLite through sqlx. The caller's
//! request headers are threaded through every call so a backend can apply
//! per-caller permissions; this one only reads `x-user-id` to record who
//! uploaded a file.

use crate::{
    models::{
        bucket::BucketMetadata,
        file::{FileMetadata, FileSummary, FileUpdate},
    },
    services::storage_service::{StoreError, StoreResult},
};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;

pub const USER_ID_HEADER: &str = "x-user-id";

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_bucket_by_id(&self, id: &str, headers: &HeaderMap)
    -> StoreResult<BucketMetadata>;

    async fn get_file_by_id(
        &self,
        id: &str,
        headers: &HeaderMap,
    ) -> StoreResult<(FileMetadata, BucketMetadata)>;

    /// Create the placeholder record of a file whose content is not written yet.
    async fn initialize_file(
        &self,
        id: &str,
        name: &str,
        size: i64,
        bucket_id: &str,
        mime_type: &str,
        headers: &HeaderMap,
    ) -> StoreResult<()>;

    async fn populate_metadata(
        &self,
        update: &FileUpdate,
        headers: &HeaderMap,
    ) -> StoreResult<FileMetadata>;

    async fn set_is_uploaded(
        &self,
        id: &str,
        is_uploaded: bool,
        headers: &HeaderMap,
    ) -> StoreResult<()>;

    async fn delete_file_by_id(&self, id: &str, headers: &HeaderMap) -> StoreResult<()>;

    async fn list_files(&self, headers: &HeaderMap) -> StoreResult<Vec<FileSummary>>;

    async fn check_health(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Row shape of `files`; `metadata` is JSON text.
#[derive(FromRow)]
struct FileRow {
    id: String,
    name: String,
    size: i64,
    bucket_id: String,
    etag: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_uploaded: bool,
    mime_type: String,
    uploaded_by_user_id: Option<String>,
    metadata: Option<String>,
}

impl TryFrom<FileRow> for FileMetadata {
    type Error = StoreError;

    fn try_from(row: FileRow) -> StoreResult<Self> {
        let metadata = row
            .metadata
            .as_deref()
            .map(|raw| serde_json::from_str::<Map<String, Value>>(raw))
            .transpose()?;
        Ok(FileMetadata {
            id: row.id,
            name: row.name,
            size: row.size,
            bucket_id: row.bucket_id,
            etag: row.etag,
            created_at: row.created_at,
            updated_at: row.updated_at,
            is_uploaded: row.is_uploaded,
            mime_type: row.mime_type,
            uploaded_by_user_id: row.uploaded_by_user_id,
            metadata,
        })
    }
}

const FILE_COLUMNS: &str = "id, name, size, bucket_id, etag, created_at, updated_at, \
     is_uploaded, mime_type, uploaded_by_user_id, metadata";

const BUCKET_COLUMNS: &str = "id, min_upload_file_size, max_upload_file_size, \
     presigned_urls_enabled, download_expiration, cache_control, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn fetch_bucket(&self, id: &str) -> StoreResult<BucketMetadata> {
        sqlx::query_as::<_, BucketMetadata>(&format!(
            "SELECT {} FROM buckets WHERE id = ?",
            BUCKET_COLUMNS
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::BucketNotFound(id.to_string()),
            other => StoreError::Sqlx(other),
        })
    }

    /// Insert or replace a bucket record.
    pub async fn upsert_bucket(&self, bucket: &BucketMetadata) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO buckets (
                id, min_upload_file_size, max_upload_file_size, presigned_urls_enabled,
                download_expiration, cache_control, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                min_upload_file_size = excluded.min_upload_file_size,
                max_upload_file_size = excluded.max_upload_file_size,
                presigned_urls_enabled = excluded.presigned_urls_enabled,
                download_expiration = excluded.download_expiration,
                cache_control = excluded.cache_control,
                updated_at = excluded.updated_at",
        )
        .bind(&bucket.id)
        .bind(bucket.min_upload_file_size)
        .bind(bucket.max_upload_file_size)
        .bind(bucket.presigned_urls_enabled)
        .bind(bucket.download_expiration)
        .bind(&bucket.cache_control)
        .bind(bucket.created_at)
        .bind(bucket.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_bucket_by_id(
        &self,
        id: &str,
        _headers: &HeaderMap,
    ) -> StoreResult<BucketMetadata> {
        self.fetch_bucket(id).await
    }

    async fn get_file_by_id(
        &self,
        id: &str,
        _headers: &HeaderMap,
    ) -> StoreResult<(FileMetadata, BucketMetadata)> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {} FROM files WHERE id = ?",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::FileNotFound(id.to_string()),
            other => StoreError::Sqlx(other),
        })?;

        let file = FileMetadata::try_from(row)?;
        let bucket = self.fetch_bucket(&file.bucket_id).await?;
        Ok((file, bucket))
    }

    async fn initialize_file(
        &self,
        id: &str,
        name: &str,
        size: i64,
        bucket_id: &str,
        mime_type: &str,
        headers: &HeaderMap,
    ) -> StoreResult<()> {
        let uploaded_by = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO files (
                id, bucket_id, name, size, mime_type, etag, is_uploaded,
                uploaded_by_user_id, metadata, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, '', 0, ?, NULL, ?, ?)",
        )
        .bind(id)
        .bind(bucket_id)
        .bind(name)
        .bind(size)
        .bind(mime_type)
        .bind(uploaded_by)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::FileAlreadyExists(id.to_string())
            } else {
                StoreError::Sqlx(err)
            }
        })?;

        debug!(file_id = id, bucket_id, "initialized file record");
        Ok(())
    }

    async fn populate_metadata(
        &self,
        update: &FileUpdate,
        _headers: &HeaderMap,
    ) -> StoreResult<FileMetadata> {
        let metadata = update
            .metadata
            .as_ref()
            .map(|map| serde_json::to_string(map))
            .transpose()?;

        let row = sqlx::query_as::<_, FileRow>(&format!(
            "UPDATE files SET
                name = ?, size = ?, bucket_id = ?, etag = ?, is_uploaded = ?,
                mime_type = ?, metadata = ?, updated_at = ?
             WHERE id = ?
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(&update.name)
        .bind(update.size)
        .bind(&update.bucket_id)
        .bind(&update.etag)
        .bind(update.is_uploaded)
        .bind(&update.mime_type)
        .bind(metadata)
        .bind(Utc::now())
        .bind(&update.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::FileNotFound(update.id.clone()),
            other => StoreError::Sqlx(other),
        })?;

        FileMetadata::try_from(row)
    }

    async fn set_is_uploaded(
        &self,
        id: &str,
        is_uploaded: bool,
        _headers: &HeaderMap,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE files SET is_uploaded = ?, updated_at = ? WHERE id = ?")
            .bind(is_uploaded)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FileNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_file_by_id(&self, id: &str, _headers: &HeaderMap) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FileNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_files(&self, _headers: &HeaderMap) -> StoreResult<Vec<FileSummary>> {
        let files = sqlx::query_as::<_, FileSummary>(
            "SELECT id, name, bucket_id, is_uploaded FROM files ORDER BY bucket_id, id",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    async fn check_health(&self) -> StoreResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one != 1 {
            return Err(StoreError::Sqlx(sqlx::Error::Protocol(format!(
                "unexpected result: {}",
                one
            ))));
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
