//! File operations and the collaborators they coordinate.
//!
//! `storage_service` holds `FileService` and the read paths; each write
//! path and the reconciliation engine extend it from their own module.

pub mod conditional;
pub mod content_store;
pub mod delete;
pub mod image;
pub mod metadata_store;
pub mod reconcile;
pub mod replace;
pub mod scanner;
pub mod sniff;
pub mod spool;
pub mod storage_service;
pub mod upload;

#[cfg(test)]
pub mod testing;
