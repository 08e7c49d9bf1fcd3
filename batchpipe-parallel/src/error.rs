//! Error types for prefetching

use thiserror::Error;

/// Result type for prefetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for prefetch operations
#[derive(Error, Debug)]
pub enum Error {
    /// Error raised by the pipeline while building or processing a batch
    #[error(transparent)]
    Core(#[from] batchpipe_core::Error),

    /// A prefetch thread could not be started
    #[error("Failed to spawn prefetch thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The prefetch threads stopped before delivering every batch
    #[error("Prefetch threads disconnected")]
    Disconnected,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
