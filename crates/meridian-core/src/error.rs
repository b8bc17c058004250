//! Error types for host infrastructure.

use thiserror::Error;

/// Infrastructure errors.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Worker process could not be spawned.
    #[error("failed to spawn worker process: {0}")]
    Spawn(String),

    /// Worker process exited immediately after spawn.
    #[error("worker process exited immediately with status {0}")]
    ExitedImmediately(String),

    /// Waiting on or signalling the worker process failed.
    #[error("worker process error: {0}")]
    Process(String),

    /// Shared-memory region not found.
    #[error("shared memory region not found: {0}")]
    RegionNotFound(String),

    /// Shared-memory read out of the region's bounds.
    #[error("shared memory read out of range in region {name}: offset {offset} count {count} len {len}")]
    RegionOutOfRange {
        name: String,
        offset: u64,
        count: u64,
        len: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for infrastructure operations.
pub type Result<T> = std::result::Result<T, CoreError>;
