//! Error types for kernels and notebook execution

use nbstatic_notebook::NotebookError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to a kernel process
#[derive(Error, Debug)]
pub enum KernelError {
    /// No command is configured for the requested kernel
    #[error("No kernel configured for '{0}'")]
    UnknownKernel(String),

    /// Kernel command line is empty
    #[error("Kernel '{0}' has an empty command")]
    EmptyCommand(String),

    /// Kernel process could not be started
    #[error("Failed to start kernel '{name}': {source}")]
    Spawn {
        /// Kernel name
        name: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// Kernel process went away before replying
    #[error("Kernel '{name}' exited unexpectedly ({status}){stderr}")]
    Died {
        /// Kernel name
        name: String,
        /// Exit status description
        status: String,
        /// Tail of the kernel's stderr, prefixed with ": " when non-empty
        stderr: String,
    },

    /// Kernel did not reply in time
    #[error("Kernel did not reply within {0:?}")]
    Timeout(Duration),

    /// Reply could not be decoded
    #[error("Malformed kernel reply: {0}")]
    Protocol(String),

    /// I/O error on the kernel pipes
    #[error("Kernel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZeroMQ error on a kernel channel
    #[error("Kernel channel error: {0}")]
    Transport(#[from] zeromq::ZmqError),

    /// Kernel was started but never answered `kernel_info_request`
    #[error("Kernel '{name}' did not become ready within {timeout:?}")]
    NotReady {
        /// Kernel name
        name: String,
        /// Startup budget
        timeout: Duration,
    },
}

/// Errors raised by the notebook executor
///
/// Every variant names the notebook being executed so batch logs can be
/// traced back to a file.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The whole-notebook deadline elapsed
    #[error("Execution of {} timed out after {timeout:?}", .path.display())]
    Timeout {
        /// Notebook path
        path: PathBuf,
        /// Configured timeout
        timeout: Duration,
    },

    /// A cell raised an exception; remaining cells were not run
    #[error("Execution of {} failed in cell {cell}: {ename}: {evalue}", .path.display())]
    Cell {
        /// Notebook path
        path: PathBuf,
        /// Zero-based index of the failing cell in the document
        cell: usize,
        /// Exception class name
        ename: String,
        /// Exception message
        evalue: String,
        /// Traceback lines
        traceback: Vec<String>,
    },

    /// Kernel could not be started or stopped responding
    #[error("Execution of {} failed: {source}", .path.display())]
    Kernel {
        /// Notebook path
        path: PathBuf,
        /// Kernel failure
        #[source]
        source: KernelError,
    },

    /// Notebook could not be read or written
    #[error("Notebook {} could not be processed: {source}", .path.display())]
    Notebook {
        /// Notebook path
        path: PathBuf,
        /// Notebook failure
        #[source]
        source: NotebookError,
    },

    /// Filesystem error around execution
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl ExecutionError {
    /// Notebook path this error refers to
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Timeout { path, .. }
            | Self::Cell { path, .. }
            | Self::Kernel { path, .. }
            | Self::Notebook { path, .. }
            | Self::Io { path, .. } => path,
        }
    }
}

/// Result type alias for kernel operations
pub type Result<T> = std::result::Result<T, KernelError>;
