//! Overwrite of an existing, uploaded file.
//!
//! `isUploaded` is flipped to false before anything is written and put
//! back if the scan or the content write fails. A failure while writing
//! the final metadata is not compensated: the content is already new, so
//! the record stays not-uploaded and shows up in `list_not_uploaded`.

use crate::{
    errors::{ApiError, ApiResult},
    models::{
        file::{FileMetadata, FileUpdate},
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
use tracing::{error, info, warn};

/// New content for an existing file.
#[derive(Debug)]
pub struct ReplaceFile {
    /// New name; the stored one is kept when absent.
    pub name: Option<String>,
    pub content: FileSource,
    /// New user metadata; the stored map is kept when absent.
    pub metadata: Option<Map<String, Value>>,
}

impl FileService {
    pub async fn replace_file(
        &self,
        id: &str,
        file: ReplaceFile,
        headers: &HeaderMap,
    ) -> ApiResult<FileMetadata> {
        let (existing, bucket) = self
            .metadata
            .get_file_by_id(id, headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem getting file metadata"))?;
        if !existing.is_uploaded {
            return Err(ApiError::forbidden("file is not uploaded yet")
                .extend(format!("refusing to replace pending file {}", id)));
        }

        let name = file.name.unwrap_or_else(|| existing.name.clone());
        let size = file.content.size() as i64;
        check_file_size(&bucket, &name, size)?;

        self.metadata
            .set_is_uploaded(id, false, headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem flagging file as not uploaded"))?;
        let mut lifecycle = FileLifecycle::pending(id);

        let mime_type = sniff::detect_content_type(file.content.head());

        lifecycle.advance(FilePhase::Scanning);
        if let Err(err) = self.scan_content(&name, id, &file.content).await {
            self.restore_uploaded(&mut lifecycle, headers).await;
            return Err(err);
        }

        lifecycle.advance(FilePhase::Writing);
        let key = existing.content_key();
        let written = match file.content.open().await {
            Ok(body) => self.content.put_file(body, &key, &mime_type).await,
            Err(err) => Err(err.into()),
        };
        let etag = match written {
            Ok(etag) => etag,
            Err(err) => {
                self.restore_uploaded(&mut lifecycle, headers).await;
                return Err(ApiError::from(err).extend(format!("problem writing {}", key)));
            }
        };

        lifecycle.advance(FilePhase::Populating);
        let update = FileUpdate {
            id: id.to_string(),
            name,
            size,
            bucket_id: existing.bucket_id.clone(),
            etag,
            is_uploaded: true,
            mime_type,
            metadata: file.metadata.or(existing.metadata),
        };
        let replaced = match self.metadata.populate_metadata(&update, headers).await {
            Ok(replaced) => replaced,
            Err(err) => {
                error!(
                    file_id = id,
                    key = %key,
                    "content replaced but metadata was not updated, file left not uploaded"
                );
                return Err(ApiError::from(err).extend("problem populating file metadata"));
            }
        };
        lifecycle.advance(FilePhase::Populated);

        info!(file_id = id, size, "replaced file");
        Ok(replaced)
    }

    /// Put `isUploaded` back after a failure before content was committed.
    /// A failure here is logged and never masks the original error.
    async fn restore_uploaded(&self, lifecycle: &mut FileLifecycle, headers: &HeaderMap) {
        let id = lifecycle.file_id().to_string();
        if !lifecycle.is_restorable() {
            warn!(file_id = %id, phase = %lifecycle.phase(), "content already committed, not restoring isUploaded");
            return;
        }
        lifecycle.advance(FilePhase::RestoredPending);
        if let Err(err) = self.metadata.set_is_uploaded(&id, true, headers).await {
            warn!(file_id = %id, error = %err, "could not restore isUploaded");
        }
    }
}
