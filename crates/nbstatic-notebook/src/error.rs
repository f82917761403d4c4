//! Error types for Jupyter notebook I/O

use thiserror::Error;

/// Error type for notebook read/write operations
#[derive(Error, Debug)]
pub enum NotebookError {
    /// I/O error when reading or writing a notebook file
    #[error("Failed to access notebook file: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("Failed to parse notebook JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid notebook structure or format
    #[error("Invalid notebook format: {0}")]
    InvalidFormat(String),

    /// Notebook version not supported
    #[error("Unsupported notebook version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version number
        major: u64,
        /// Minor version number
        minor: u64,
    },
}

/// Result type alias for notebook operations
pub type Result<T> = std::result::Result<T, NotebookError>;
