//! HTTP handlers. They parse requests, call `FileService` and render the
//! JSON envelopes; storage concerns stay in `services`.

use crate::services::{spool::Spooler, storage_service::FileService};

pub mod file_handlers;
pub mod health_handlers;
pub mod ops_handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: FileService,
    /// Externally reachable base URL without a trailing slash.
    pub public_url: String,
    /// Required in `x-admin-secret` on maintenance routes when set.
    pub admin_secret: Option<String>,
    /// Where uploaded parts wait while they are scanned and stored.
    pub spooler: Spooler,
}
