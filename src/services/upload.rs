//! Multi-file upload.
//!
//! Files in a batch are processed one after another in request order. The
//! first failure stops the batch: files completed before it are returned
//! as processed, the failing file and everything after it are not.

use crate::{
    errors::{ApiError, ApiResult},
    models::{
        bucket::BucketMetadata,
        file::{FileMetadata, FileUpdate, content_key},
        lifecycle::{FileLifecycle, FilePhase},
    },
    services::{
        sniff,
        spool::FileSource,
        storage_service::{FileService, check_file_size},
    },
};
use axum::http::HeaderMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One file of an upload batch.
#[derive(Debug)]
pub struct UploadFile {
    pub name: String,
    /// Client-chosen id; generated when absent.
    pub id: Option<String>,
    pub content: FileSource,
    pub metadata: Option<Map<String, Value>>,
}

impl UploadFile {
    pub fn size(&self) -> i64 {
        self.content.size() as i64
    }
}

/// Result of a batch: the completed prefix and, if the batch stopped
/// early, the error that stopped it.
#[derive(Debug)]
pub struct UploadOutcome {
    pub processed: Vec<FileMetadata>,
    pub error: Option<ApiError>,
}

impl UploadOutcome {
    pub fn into_result(self) -> ApiResult<Vec<FileMetadata>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.processed),
        }
    }
}

impl FileService {
    /// Upload `files` into `bucket_id`.
    pub async fn upload_files(
        &self,
        bucket_id: &str,
        files: Vec<UploadFile>,
        headers: &HeaderMap,
    ) -> UploadOutcome {
        match self.get_bucket(bucket_id, headers).await {
            Ok(bucket) => self.upload_into(&bucket, files, headers).await,
            Err(err) => UploadOutcome {
                processed: Vec::new(),
                error: Some(err),
            },
        }
    }

    /// Upload `files` into an already resolved bucket.
    pub async fn upload_into(
        &self,
        bucket: &BucketMetadata,
        files: Vec<UploadFile>,
        headers: &HeaderMap,
    ) -> UploadOutcome {
        let bucket_id = bucket.id.as_str();
        let total = files.len();
        let mut processed = Vec::with_capacity(total);
        for file in files {
            let name = file.name.clone();
            match self.upload_single(bucket, file, headers).await {
                Ok(metadata) => processed.push(metadata),
                Err(err) => {
                    warn!(
                        bucket_id,
                        name,
                        completed = processed.len(),
                        total,
                        "upload batch stopped"
                    );
                    return UploadOutcome {
                        processed,
                        error: Some(err.extend(format!("problem processing file {}", name))),
                    };
                }
            }
        }

        info!(bucket_id, count = processed.len(), "uploaded files");
        UploadOutcome {
            processed,
            error: None,
        }
    }

    async fn upload_single(
        &self,
        bucket: &BucketMetadata,
        file: UploadFile,
        headers: &HeaderMap,
    ) -> ApiResult<FileMetadata> {
        let id = file
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let size = file.size();
        check_file_size(bucket, &file.name, size)?;

        self.metadata
            .initialize_file(&id, &file.name, size, &bucket.id, "", headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem initializing file metadata"))?;
        let mut lifecycle = FileLifecycle::pending(&id);

        let mime_type = sniff::detect_content_type(file.content.head());
        debug!(file_id = %id, %mime_type, size, "sniffed content type");

        lifecycle.advance(FilePhase::Scanning);
        if let Err(err) = self.scan_content(&file.name, &id, &file.content).await {
            self.discard_placeholder(&id, headers).await;
            return Err(err);
        }

        lifecycle.advance(FilePhase::Writing);
        let key = content_key(&bucket.id, &id);
        let written = match file.content.open().await {
            Ok(body) => self.content.put_file(body, &key, &mime_type).await,
            Err(err) => Err(err.into()),
        };
        let etag = match written {
            Ok(etag) => etag,
            Err(err) => {
                self.discard_placeholder(&id, headers).await;
                return Err(ApiError::from(err).extend(format!("problem writing {}", key)));
            }
        };

        lifecycle.advance(FilePhase::Populating);
        let metadata = self
            .metadata
            .populate_metadata(
                &FileUpdate {
                    id: id.clone(),
                    name: file.name,
                    size,
                    bucket_id: bucket.id.clone(),
                    etag,
                    is_uploaded: true,
                    mime_type,
                    metadata: file.metadata,
                },
                headers,
            )
            .await
            .map_err(|e| ApiError::from(e).extend("problem populating file metadata"))?;
        lifecycle.advance(FilePhase::Populated);

        if bucket.presigned_urls_enabled {
            self.content
                .create_presigned_url(&key, bucket.download_expiration())
                .await
                .map_err(|e| ApiError::from(e).extend("problem creating presigned URL"))?;
        }

        Ok(metadata)
    }

    /// Best-effort removal of a placeholder whose content never made it.
    /// Failure is logged and never replaces the original error.
    async fn discard_placeholder(&self, id: &str, headers: &HeaderMap) {
        if let Err(err) = self.metadata.delete_file_by_id(id, headers).await {
            warn!(file_id = id, error = %err, "could not remove placeholder record");
        }
    }
}
