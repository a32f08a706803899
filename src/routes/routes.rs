//! Defines routes for the file gateway.
//!
//! ## Structure
//! - **File endpoints**
//!   - `POST   /files`: multipart upload of one or more files
//!   - `GET    /files/{id}`: download (conditional, range, image options)
//!   - `HEAD   /files/{id}`: headers only
//!   - `PUT    /files/{id}`: replace content
//!   - `DELETE /files/{id}`: delete
//!   - `GET    /files/{id}/presignedurl`: mint a presigned URL
//!   - `GET    /files/{id}/presignedurl/contents`: signature-authorized download
//!
//! - **Maintenance endpoints** under `/ops`, guarded by `x-admin-secret`.
//! - **Health endpoints** `/healthz`, `/readyz`, `/version`.

use crate::handlers::{
    AppState,
    file_handlers::{
        delete_file, get_file, get_presigned_contents, get_presigned_url, head_file,
        replace_file, upload_files,
    },
    health_handlers::{healthz, readyz, version},
    ops_handlers::{
        delete_broken_metadata, delete_orphans, list_broken_metadata, list_not_uploaded,
        list_orphans,
    },
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router for every gateway route.
///
/// `max_body_bytes` caps a whole request body, all multipart parts included.
pub fn routes(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        // file routes
        .route("/files", post(upload_files))
        .route(
            "/files/{id}",
            get(get_file)
                .head(head_file)
                .put(replace_file)
                .delete(delete_file),
        )
        .route("/files/{id}/presignedurl", get(get_presigned_url))
        .route(
            "/files/{id}/presignedurl/contents",
            get(get_presigned_contents),
        )
        // maintenance routes
        .route("/ops/list-orphans", get(list_orphans))
        .route("/ops/delete-orphans", post(delete_orphans))
        .route("/ops/list-broken-metadata", get(list_broken_metadata))
        .route("/ops/delete-broken-metadata", post(delete_broken_metadata))
        .route("/ops/list-not-uploaded", get(list_not_uploaded))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
