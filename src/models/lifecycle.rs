//! Per-file write state machine used by the upload and replace paths.
//!
//! ```text
//! Pending -> Scanning -> Writing -> Populating -> Populated
//!    \__________\__________\
//!                           `-> RestoredPending
//! ```
//!
//! `RestoredPending` is the only backward edge: the compensation that puts
//! `isUploaded` back after a failure that happened before content was
//! committed.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePhase {
    /// Record exists with `isUploaded = false`.
    Pending,
    Scanning,
    /// Content write in flight; the previous object (if any) is untouched.
    Writing,
    /// Content committed, final metadata not yet written.
    Populating,
    Populated,
    RestoredPending,
}

impl FilePhase {
    fn can_advance_to(self, next: FilePhase) -> bool {
        use FilePhase::*;
        matches!(
            (self, next),
            (Pending, Scanning)
                | (Scanning, Writing)
                | (Writing, Populating)
                | (Populating, Populated)
                | (Pending | Scanning | Writing, RestoredPending)
        )
    }
}

impl fmt::Display for FilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilePhase::Pending => "pending",
            FilePhase::Scanning => "scanning",
            FilePhase::Writing => "writing",
            FilePhase::Populating => "populating",
            FilePhase::Populated => "populated",
            FilePhase::RestoredPending => "restored-pending",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct FileLifecycle {
    file_id: String,
    phase: FilePhase,
}

impl FileLifecycle {
    pub fn pending(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            phase: FilePhase::Pending,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn phase(&self) -> FilePhase {
        self.phase
    }

    /// Move to `next`.
    ///
    /// # Panics
    ///
    /// On an edge that is not in the state machine; callers drive the
    /// phases in a fixed order, so this is a programming error.
    pub fn advance(&mut self, next: FilePhase) {
        assert!(
            self.phase.can_advance_to(next),
            "file {}: illegal transition {} -> {}",
            self.file_id,
            self.phase,
            next
        );
        tracing::trace!(file_id = %self.file_id, from = %self.phase, to = %next, "file phase");
        self.phase = next;
    }

    /// True while no content has been committed, so flipping `isUploaded`
    /// back leaves the previous content visible and consistent.
    pub fn is_restorable(&self) -> bool {
        matches!(
            self.phase,
            FilePhase::Pending | FilePhase::Scanning | FilePhase::Writing
        )
    }
}
