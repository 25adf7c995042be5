//! Back end error variants.
//!
//! The middle end trusts its inputs: anything wrong here is an internal
//! compiler error, not a user error, so variants exist for pipeline control
//! flow (per-file validation failures, aborts) and I/O only.

use thiserror::Error;

/// Errors surfaced by the compilation pipeline.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Architecture-neutral IR validation failed for a file.
    #[error(transparent)]
    Validation(#[from] ternc_ir::ValidationError),

    /// x86_64-linux specific IR validation failed for a file.
    #[error("{file}: internal compiler error: x86_64-linux specific IR validation after {phase} failed - {reason}")]
    ArchValidation {
        /// Input file the bad IR belongs to.
        file: String,
        /// Pipeline phase that just ran.
        phase: String,
        /// First problem found.
        reason: String,
    },

    /// One or more files failed validation; later passes were skipped.
    #[error("compilation aborted: {failed} of {total} file(s) failed IR validation")]
    Aborted {
        /// How many files had errored.
        failed: usize,
        /// How many files were being compiled.
        total: usize,
    },

    /// Writing the emitted assembly failed.
    #[error("failed to write assembly: {0}")]
    Io(#[from] std::io::Error),
}
