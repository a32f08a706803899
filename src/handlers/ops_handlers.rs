//! Maintenance endpoints backed by the reconciliation engine.
//!
//! - GET  /ops/list-orphans            -> `{"files": [...]}`
//! - POST /ops/delete-orphans          -> `{"files": [...]}`
//! - GET  /ops/list-broken-metadata    -> `{"metadata": [...]}`
//! - POST /ops/delete-broken-metadata  -> `{"metadata": [...]}`
//! - GET  /ops/list-not-uploaded       -> `{"metadata": [...]}`

use crate::{
    errors::{ApiError, ApiResult},
    handlers::AppState,
    models::file::FileSummary,
};
use axum::{Json, extract::State, http::HeaderMap};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub metadata: Vec<FileSummary>,
}

fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(secret) = state.admin_secret.as_deref() else {
        return Ok(());
    };
    let given = headers
        .get(ADMIN_SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !secret_matches(given, secret.as_bytes()) {
        return Err(ApiError::forbidden("you are not authorized")
            .extend("missing or wrong x-admin-secret on maintenance route"));
    }
    Ok(())
}

/// Constant-time comparison: MAC both values under the expected secret and
/// let `verify_slice` compare the tags.
fn secret_matches(given: &[u8], expected: &[u8]) -> bool {
    let tag = |value: &[u8]| {
        Hmac::<Sha256>::new_from_slice(expected).map(|mut mac| {
            mac.update(value);
            mac
        })
    };
    match (tag(given), tag(expected)) {
        (Ok(given), Ok(expected)) => given
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

pub async fn list_orphans(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FilesResponse>> {
    authorize(&state, &headers)?;
    let files = state.service.list_orphans(&headers).await?;
    Ok(Json(FilesResponse { files }))
}

pub async fn delete_orphans(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FilesResponse>> {
    authorize(&state, &headers)?;
    let files = state.service.delete_orphans(&headers).await?;
    Ok(Json(FilesResponse { files }))
}

pub async fn list_broken_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<MetadataResponse>> {
    authorize(&state, &headers)?;
    let metadata = state.service.list_broken_metadata(&headers).await?;
    Ok(Json(MetadataResponse { metadata }))
}

pub async fn delete_broken_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<MetadataResponse>> {
    authorize(&state, &headers)?;
    let metadata = state.service.delete_broken_metadata(&headers).await?;
    Ok(Json(MetadataResponse { metadata }))
}

pub async fn list_not_uploaded(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<MetadataResponse>> {
    authorize(&state, &headers)?;
    let metadata = state.service.list_not_uploaded(&headers).await?;
    Ok(Json(MetadataResponse { metadata }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_compare_exactly() {
        assert!(secret_matches(b"s3cret", b"s3cret"));
        assert!(!secret_matches(b"s3cre", b"s3cret"));
        assert!(!secret_matches(b"s3cret!", b"s3cret"));
        assert!(!secret_matches(b"", b"s3cret"));
    }
}
