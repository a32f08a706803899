//! Reconciliation between the metadata store and the content store.
//!
//! Every projection is computed from two full listings. Matching is exact
//! string equality on `{bucketId}/{id}`. Deletes stop at the first failure
//! and do not undo the deletes that already happened.

use crate::{
    errors::{ApiError, ApiResult},
    models::file::FileSummary,
    services::storage_service::FileService,
};
use axum::http::HeaderMap;
use std::collections::HashSet;
use tracing::{info, warn};

/// Content keys with no metadata record.
pub fn find_orphans(files: &[FileSummary], keys: &[String]) -> Vec<String> {
    let known: HashSet<String> = files.iter().map(FileSummary::content_key).collect();
    keys.iter()
        .filter(|key| !known.contains(key.as_str()))
        .cloned()
        .collect()
}

/// Uploaded records with no content object. Pending records never qualify.
pub fn find_broken_metadata(files: &[FileSummary], keys: &[String]) -> Vec<FileSummary> {
    let present: HashSet<&str> = keys.iter().map(String::as_str).collect();
    files
        .iter()
        .filter(|file| file.is_uploaded && !present.contains(file.content_key().as_str()))
        .cloned()
        .collect()
}

pub fn find_not_uploaded(files: &[FileSummary]) -> Vec<FileSummary> {
    files.iter().filter(|file| !file.is_uploaded).cloned().collect()
}

impl FileService {
    async fn listings(&self, headers: &HeaderMap) -> ApiResult<(Vec<FileSummary>, Vec<String>)> {
        let files = self
            .metadata
            .list_files(headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem listing file metadata"))?;
        let keys = self
            .content
            .list_files()
            .await
            .map_err(|e| ApiError::from(e).extend("problem listing content objects"))?;
        Ok((files, keys))
    }

    pub async fn list_orphans(&self, headers: &HeaderMap) -> ApiResult<Vec<String>> {
        let (files, keys) = self.listings(headers).await?;
        Ok(find_orphans(&files, &keys))
    }

    /// Delete every orphaned content object and return the deleted keys.
    pub async fn delete_orphans(&self, headers: &HeaderMap) -> ApiResult<Vec<String>> {
        let orphans = self.list_orphans(headers).await?;
        for (done, key) in orphans.iter().enumerate() {
            if let Err(err) = self.content.delete_file(key).await {
                warn!(key = %key, deleted = done, total = orphans.len(), "orphan cleanup stopped");
                return Err(ApiError::from(err).extend(format!("problem deleting orphan {}", key)));
            }
        }
        info!(count = orphans.len(), "deleted orphaned content");
        Ok(orphans)
    }

    pub async fn list_broken_metadata(&self, headers: &HeaderMap) -> ApiResult<Vec<FileSummary>> {
        let (files, keys) = self.listings(headers).await?;
        Ok(find_broken_metadata(&files, &keys))
    }

    /// Delete every broken metadata record and return the deleted records.
    pub async fn delete_broken_metadata(
        &self,
        headers: &HeaderMap,
    ) -> ApiResult<Vec<FileSummary>> {
        let broken = self.list_broken_metadata(headers).await?;
        for (done, file) in broken.iter().enumerate() {
            if let Err(err) = self.metadata.delete_file_by_id(&file.id, headers).await {
                warn!(file_id = %file.id, deleted = done, total = broken.len(), "broken metadata cleanup stopped");
                return Err(ApiError::from(err)
                    .extend(format!("problem deleting broken metadata {}", file.id)));
            }
        }
        info!(count = broken.len(), "deleted broken metadata");
        Ok(broken)
    }

    pub async fn list_not_uploaded(&self, headers: &HeaderMap) -> ApiResult<Vec<FileSummary>> {
        let files = self
            .metadata
            .list_files(headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem listing file metadata"))?;
        Ok(find_not_uploaded(&files))
    }
}
