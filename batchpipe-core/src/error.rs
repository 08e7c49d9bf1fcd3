//! Error types for batch pipelines

use thiserror::Error;

/// Boxed error produced by collaborator code (actions, batch factories)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for batch pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for batch pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// A key appears more than once in an index
    #[error("Duplicate key in index: {key}")]
    Uniqueness {
        /// Debug rendering of the repeated key
        key: String,
    },

    /// Invalid batch size, proportions, epoch count, or similar settings
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A numeric argument lies outside its allowed range
    #[error("Value out of range: {0}")]
    Range(String),

    /// The action name is not registered on the batch type the pipeline resolved to
    #[error("Action `{action}` is not registered on batch type `{batch_type}`")]
    UnknownAction {
        /// Name of the missing action
        action: String,
        /// Rust type name of the batch variant
        batch_type: &'static str,
    },

    /// An action raised while the chain was being applied
    #[error("Action `{action}` failed at position {position} of the chain: {source}")]
    ChainFailure {
        /// Name of the failing action
        action: String,
        /// Zero-based position of the failing action in the chain
        position: usize,
        /// Position of the last action that completed, if any
        last_applied: Option<usize>,
        /// The error raised by the action
        #[source]
        source: BoxError,
    },

    /// Primary and secondary sides of a paired dataset do not share a key set
    #[error("Synchronization error: {0}")]
    Synchronization(String),

    /// A key was requested that the index does not contain
    #[error("Key not found in index: {0}")]
    UnknownKey(String),

    /// The batch factory failed to build a batch
    #[error("Batch construction failed: {0}")]
    BatchConstruction(#[source] BoxError),

    /// A finite batch sequence has no more chunks
    #[error("Batch sequence exhausted")]
    Exhausted,

    /// Execution was cancelled through a cancel token
    #[error("Pipeline cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Position of the failing action for chain failures
    pub fn failed_position(&self) -> Option<usize> {
        match self {
            Error::ChainFailure { position, .. } => Some(*position),
            _ => None,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}
