use nbstatic_kernel::ExecutionError;
use nbstatic_notebook::NotebookError;
use std::path::PathBuf;
use thiserror::Error;

/// Path mapping errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("{} is not under the project base {}", path.display(), base.display())]
    OutsideBase { path: PathBuf, base: PathBuf },

    #[error("{} has no file name", .0.display())]
    NoFileName(PathBuf),
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to read {}: {source}", path.display())]
    Notebook {
        path: PathBuf,
        #[source]
        source: NotebookError,
    },

    #[error("Cell {cell} output {output} has no renderable MIME type (found: {mime_types})")]
    UnsupportedOutput {
        cell: usize,
        output: usize,
        mime_types: String,
    },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("Invalid resource {key}: {reason}")]
    InvalidResource { key: String, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Environment variable {0} should be set")]
    MissingEnv(String),

    #[error("Invalid root {name}: {reason}")]
    InvalidRoot { name: String, reason: String },
}

/// Errors raised while converting a notebook or running a batch
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_paths() {
        let err = PathError::OutsideBase {
            path: PathBuf::from("/elsewhere/a.ipynb"),
            base: PathBuf::from("/project"),
        };
        assert_eq!(
            err.to_string(),
            "/elsewhere/a.ipynb is not under the project base /project"
        );

        let err = PipelineError::from(err);
        assert!(err.to_string().contains("/elsewhere/a.ipynb"));
    }

    #[test]
    fn test_missing_env_message() {
        let err = ConfigError::MissingEnv("AUTH0_TOKEN".to_string());
        assert_eq!(
            err.to_string(),
            "Environment variable AUTH0_TOKEN should be set"
        );
    }
}
