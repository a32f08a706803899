use crate::{
    errors::{ApiError, ApiResult},
    services::storage_service::FileService,
};
use axum::http::HeaderMap;
use tracing::{info, warn};

impl FileService {
    /// Delete a file: metadata record first, then the content object.
    ///
    /// If the content delete fails the object is left as an orphan for
    /// reconciliation to pick up; the error is still returned.
    pub async fn delete_file(&self, id: &str, headers: &HeaderMap) -> ApiResult<()> {
        let (file, _) = self
            .metadata
            .get_file_by_id(id, headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem getting file metadata"))?;

        self.metadata
            .delete_file_by_id(id, headers)
            .await
            .map_err(|e| ApiError::from(e).extend("problem deleting file metadata"))?;

        let key = file.content_key();
        if let Err(err) = self.content.delete_file(&key).await {
            warn!(file_id = id, key = %key, error = %err, "metadata deleted but content left orphaned");
            return Err(ApiError::from(err).extend(format!("problem deleting {}", key)));
        }

        info!(file_id = id, key = %key, "deleted file");
        Ok(())
    }
}
