//! src/services/storage_service.rs
//!
//! FileService: the coordination layer between the metadata store, the
//! content store and the antivirus scanner. Write paths live in
//! `upload.rs`, `replace.rs` and `delete.rs`; maintenance in
//! `reconcile.rs`. This file holds the shared pieces and the read paths.
//!
//! The two stores cannot be committed together. Consistency comes from the
//! fixed step order of each operation, a small number of compensations, and
//! reconciliation as the backstop.

use crate::{
    errors::{ApiError, ApiResult},
    models::{bucket::BucketMetadata, file::FileMetadata},
    services::{
        content_store::{ContentStore, FileContent, collect_bytes},
        image::{ImageOptions, ImageTransformer, TransformedImage},
        metadata_store::MetadataStore,
        scanner::{AntivirusScanner, ScanResult},
        spool::FileSource,
    },
};
use axum::http::{HeaderMap, StatusCode};
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by the pluggable collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error("file `{0}` already exists")]
    FileAlreadyExists(String),
    #[error("content object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid content key `{0}`")]
    InvalidKey(String),
    #[error("range not satisfiable for an object of {size} bytes")]
    InvalidRange { size: u64 },
    #[error("presigned URL signature is not valid")]
    InvalidSignature,
    #[error("presigned URL signature expired")]
    SignatureExpired,
    #[error("antivirus scanner failed: {0}")]
    Scanner(String),
    #[error("image transformation failed: {0}")]
    Transform(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let public = match &err {
            StoreError::BucketNotFound(_) => ApiError::not_found("bucket not found"),
            StoreError::FileNotFound(_) | StoreError::ObjectNotFound(_) => {
                ApiError::not_found("file not found")
            }
            StoreError::FileAlreadyExists(_) => {
                ApiError::new(StatusCode::CONFLICT, "file already exists")
            }
            StoreError::InvalidKey(_) => ApiError::bad_request("invalid file id"),
            StoreError::InvalidRange { .. } => ApiError::new(
                StatusCode::RANGE_NOT_SATISFIABLE,
                "requested range not satisfiable",
            ),
            StoreError::InvalidSignature => ApiError::forbidden("signature is not valid"),
            StoreError::SignatureExpired => ApiError::forbidden("signature already expired"),
            _ => return ApiError::internal(err),
        };

        ApiError {
            cause: anyhow::Error::new(err),
            ..public
        }
    }
}

/// A signed query string granting time-limited access to one file.
#[derive(Debug, Clone, PartialEq)]
pub struct PresignedUrl {
    pub signature: String,
    /// Lifetime in seconds.
    pub expiration: u64,
}

/// Composes the collaborators for every file operation.
///
/// Cheap to clone; every collaborator sits behind an `Arc<dyn Trait>` so
/// the real backends and the in-memory fakes are interchangeable.
#[derive(Clone)]
pub struct FileService {
    pub metadata: Arc<dyn MetadataStore>,
    pub content: Arc<dyn ContentStore>,
    pub scanner: Arc<dyn AntivirusScanner>,
    pub transformer: Option<Arc<dyn ImageTransformer>>,
}

impl FileService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
        scanner: Arc<dyn AntivirusScanner>,
    ) -> Self {
        Self {
            metadata,
            content,
            scanner,
            transformer: None,
        }
    }

    pub fn with_image_transformer(mut self, transformer: Arc<dyn ImageTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub async fn get_bucket(&self, bucket_id: &str, headers: &HeaderMap) -> ApiResult<BucketMetadata> {
        self.metadata
            .get_bucket_by_id(bucket_id, headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem getting bucket metadata"))
    }

    /// Fetch a file and its bucket for a read.
    ///
    /// Files that are not uploaded yet are not readable: 403.
    pub async fn get_readable_file(
        &self,
        id: &str,
        headers: &HeaderMap,
    ) -> ApiResult<(FileMetadata, BucketMetadata)> {
        let (file, bucket) = self
            .metadata
            .get_file_by_id(id, headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem getting file metadata"))?;

        if !file.is_uploaded {
            return Err(ApiError::forbidden("file is not uploaded yet")
                .extend(format!("file {} has isUploaded = false", id)));
        }

        Ok((file, bucket))
    }

    /// Open the content of `file`, optionally restricted to a `Range` header value.
    pub async fn open_content(
        &self,
        file: &FileMetadata,
        range: Option<&str>,
    ) -> ApiResult<FileContent> {
        let key = file.content_key();
        self.content
            .get_file(&key, range)
            .await
            .map_err(|e| ApiError::from(e).extend(format!("problem reading {}", key)))
    }

    /// Same as [`open_content`](Self::open_content) but authorized by a
    /// presigned signature instead of the caller's identity.
    pub async fn open_presigned_content(
        &self,
        file: &FileMetadata,
        signature: &str,
        range: Option<&str>,
    ) -> ApiResult<FileContent> {
        let key = file.content_key();
        self.content
            .get_file_with_presigned_url(&key, signature, range)
            .await
            .map_err(|e| ApiError::from(e).extend(format!("problem reading {} via signature", key)))
    }

    /// Mint a presigned URL signature for a readable file.
    pub async fn create_presigned_url(
        &self,
        id: &str,
        headers: &HeaderMap,
    ) -> ApiResult<PresignedUrl> {
        let (file, bucket) = self.get_readable_file(id, headers).await?;
        if !bucket.presigned_urls_enabled {
            return Err(ApiError::forbidden(
                "presigned URLs are not enabled on the bucket where this file is located in",
            )
            .extend(format!("bucket {}", bucket.id)));
        }

        let expiry = bucket.download_expiration();
        let signature = self
            .content
            .create_presigned_url(&file.content_key(), expiry)
            .await
            .map_err(|e| ApiError::from(e).extend("problem creating presigned URL"))?;

        Ok(PresignedUrl {
            signature,
            expiration: expiry.as_secs(),
        })
    }

    /// Run the configured image transformer over the whole content of `file`.
    pub async fn transform_image(
        &self,
        file: &FileMetadata,
        content: FileContent,
        options: &ImageOptions,
    ) -> ApiResult<TransformedImage> {
        let Some(transformer) = &self.transformer else {
            return Err(ApiError::bad_request("image manipulation is not enabled"));
        };
        options.validate()?;
        if !file.mime_type.starts_with("image/") {
            return Err(ApiError::bad_request("image manipulation requires an image file")
                .with_data("mimeType", file.mime_type.clone()));
        }

        let bytes = collect_bytes(content.body)
            .await
            .map_err(|e| ApiError::internal(e).extend("problem reading image content"))?;
        debug!(file_id = %file.id, ?options, "transforming image");
        transformer
            .transform(bytes, file.size.max(0) as u64, options)
            .await
            .map_err(|e| ApiError::from(e).extend(format!("problem transforming file {}", file.id)))
    }

    /// Scan `content`; a detected signature is a 403 carrying the file and virus names.
    pub(crate) async fn scan_content(
        &self,
        name: &str,
        file_id: &str,
        content: &FileSource,
    ) -> ApiResult<()> {
        let body = content
            .open()
            .await
            .map_err(|e| ApiError::internal(e).extend(format!("problem reading upload {}", file_id)))?;
        let result = self.scanner.scan_reader(body).await.map_err(|e| {
            ApiError::from(e).extend(format!("problem scanning file {}", file_id))
        })?;

        match result {
            ScanResult::Clean => Ok(()),
            ScanResult::VirusFound(virus) => {
                warn!(file_id, name, virus = %virus, scanner = self.scanner.name(), "virus found");
                Err(ApiError::forbidden("virus found")
                    .with_data("file", name)
                    .with_data("virus", virus.clone())
                    .extend(format!("file {} contains {}", file_id, virus)))
            }
        }
    }
}

/// Check `size` against the bucket bounds; both bounds are inclusive.
pub fn check_file_size(bucket: &BucketMetadata, name: &str, size: i64) -> ApiResult<()> {
    if size < bucket.min_upload_file_size {
        return Err(ApiError::bad_request("file too small")
            .with_data("filename", name)
            .with_data("size", size)
            .with_data("bound", bucket.min_upload_file_size)
            .extend(format!(
                "file {} is {} bytes, bucket {} minimum is {}",
                name, size, bucket.id, bucket.min_upload_file_size
            )));
    }
    if size > bucket.max_upload_file_size {
        return Err(ApiError::bad_request("file too big")
            .with_data("filename", name)
            .with_data("size", size)
            .with_data("bound", bucket.max_upload_file_size)
            .extend(format!(
                "file {} is {} bytes, bucket {} maximum is {}",
                name, size, bucket.id, bucket.max_upload_file_size
            )));
    }
    Ok(())
}
