//! Core data models for the file gateway.
//!
//! Records map to database rows via `sqlx::FromRow` where the shapes line
//! up and serialize as camelCase JSON via `serde`.

pub mod bucket;
pub mod file;
pub mod lifecycle;
