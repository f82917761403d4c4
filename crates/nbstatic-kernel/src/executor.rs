//! Notebook executor
//!
//! Runs every code cell of a notebook on a fresh kernel and writes the
//! executed document, outputs included, to a destination file.

use crate::error::{ExecutionError, KernelError};
use crate::kernel::{Kernel, KernelLauncher, KernelSpec};
use nbstatic_notebook::{read_notebook, write_notebook, Cell, Notebook};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Suffix appended to the destination path for the pre-processed notebook
pub const TEMP_SUFFIX: &str = ".tmp";

/// Whole-notebook execution timeout used when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Home directory baked into notebooks authored in the Jupyter docker images
pub const DEFAULT_FOREIGN_HOME: &str = "/home/jovyan";

/// Executor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Wall-clock budget for all cells of one notebook
    pub timeout: Duration,
    /// Home directory literal rewritten to [`ExecutorOptions::home_dir`] in code cells
    pub foreign_home: Option<String>,
    /// Home directory of the current user
    pub home_dir: Option<PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            foreign_home: Some(DEFAULT_FOREIGN_HOME.to_string()),
            home_dir: dirs::home_dir(),
        }
    }
}

/// Path of the pre-processed copy written next to `destination`
#[must_use]
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Removes a file when dropped
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => debug!(path = %self.0.display(), "Removed temporary notebook"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.0.display(), "Failed to remove temporary notebook: {e}"),
        }
    }
}

/// Executes notebooks on kernels started by a [`KernelLauncher`]
#[derive(Clone)]
pub struct NotebookExecutor {
    launcher: Arc<dyn KernelLauncher>,
    options: ExecutorOptions,
}

impl std::fmt::Debug for NotebookExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookExecutor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl NotebookExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(launcher: Arc<dyn KernelLauncher>, options: ExecutorOptions) -> Self {
        Self { launcher, options }
    }

    /// Executor settings
    #[must_use]
    pub const fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Execute `source` and write the executed notebook to `destination`
    ///
    /// The kernel runs in the destination's directory. A pre-processed copy is
    /// written to `destination` + [`TEMP_SUFFIX`] and removed whatever the
    /// outcome. Any existing file at `destination` is removed before the run,
    /// and the destination is only written once every cell succeeded.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] naming `source` if the notebook cannot be
    /// read or written, the kernel fails, a cell raises, or the timeout
    /// elapses.
    pub fn execute_file(&self, source: &Path, destination: &Path) -> Result<(), ExecutionError> {
        let working_dir = destination
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(working_dir).map_err(|e| io_error(working_dir, e))?;
        remove_if_exists(destination).map_err(|e| io_error(destination, e))?;

        let temp_path = temp_path_for(destination);
        let _cleanup = TempFile(temp_path.clone());

        let mut notebook = read_notebook(source).map_err(|e| notebook_error(source, e))?;
        let rewritten = self.normalize_sources(&mut notebook);
        if rewritten > 0 {
            debug!(notebook = %source.display(), cells = rewritten, "Rewrote home directory in code cells");
        }
        write_notebook(&notebook, &temp_path).map_err(|e| notebook_error(&temp_path, e))?;

        let mut notebook = read_notebook(&temp_path).map_err(|e| notebook_error(&temp_path, e))?;
        self.execute_notebook(&mut notebook, source, working_dir)?;

        write_notebook(&notebook, destination).map_err(|e| notebook_error(destination, e))?;
        info!(notebook = %source.display(), output = %destination.display(), "Executed notebook");
        Ok(())
    }

    /// Rewrite the foreign home directory literal in code cells
    ///
    /// Returns the number of cells changed.
    pub fn normalize_sources(&self, notebook: &mut Notebook) -> usize {
        let (Some(foreign), Some(home)) = (&self.options.foreign_home, &self.options.home_dir)
        else {
            return 0;
        };
        if foreign.is_empty() {
            return 0;
        }
        let home = home.to_string_lossy();
        let mut changed = 0;
        for cell in notebook.code_cells_mut() {
            if cell.source.as_str().contains(foreign.as_str()) {
                cell.source.0 = cell.source.as_str().replace(foreign.as_str(), &home);
                changed += 1;
            }
        }
        changed
    }

    /// Run all code cells of `notebook` on a fresh kernel, in order
    ///
    /// Outputs and execution counts are replaced in place. The first failing
    /// cell stops execution; its error output is kept on the cell.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Cell`] for the first failing cell,
    /// [`ExecutionError::Timeout`] when the budget is exhausted, and
    /// [`ExecutionError::Kernel`] when the kernel cannot start or dies.
    pub fn execute_notebook(
        &self,
        notebook: &mut Notebook,
        path: &Path,
        working_dir: &Path,
    ) -> Result<(), ExecutionError> {
        let spec = KernelSpec::from_notebook(notebook);
        debug!(notebook = %path.display(), kernel = %spec.name, "Launching kernel");
        let mut kernel = self
            .launcher
            .launch(&spec, working_dir)
            .map_err(|source| ExecutionError::Kernel {
                path: path.to_path_buf(),
                source,
            })?;

        let result = self.run_cells(kernel.as_mut(), notebook, path);
        if let Err(e) = kernel.shutdown() {
            warn!(notebook = %path.display(), "Failed to shut kernel down: {e}");
        }
        result
    }

    fn run_cells(
        &self,
        kernel: &mut dyn Kernel,
        notebook: &mut Notebook,
        path: &Path,
    ) -> Result<(), ExecutionError> {
        let timeout = self.options.timeout;
        let started = Instant::now();
        let mut execution_count = 0;

        for (index, cell) in notebook.cells.iter_mut().enumerate() {
            let Cell::Code(code) = cell else { continue };
            if code.source.as_str().trim().is_empty() {
                code.outputs.clear();
                code.execution_count = None;
                continue;
            }

            let remaining = timeout
                .checked_sub(started.elapsed())
                .filter(|left| !left.is_zero())
                .ok_or_else(|| ExecutionError::Timeout {
                    path: path.to_path_buf(),
                    timeout,
                })?;

            execution_count += 1;
            debug!(notebook = %path.display(), cell = index, "Executing cell");
            let reply = kernel
                .execute(code.source.as_str(), execution_count, remaining)
                .map_err(|source| match source {
                    KernelError::Timeout(_) => ExecutionError::Timeout {
                        path: path.to_path_buf(),
                        timeout,
                    },
                    source => ExecutionError::Kernel {
                        path: path.to_path_buf(),
                        source,
                    },
                })?;

            code.execution_count = Some(execution_count);
            code.outputs = reply.outputs;
            if let Some(failure) = reply.failure {
                return Err(ExecutionError::Cell {
                    path: path.to_path_buf(),
                    cell: index,
                    ename: failure.ename,
                    evalue: failure.evalue,
                    traceback: failure.traceback,
                });
            }
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ExecutionError {
    ExecutionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn notebook_error(path: &Path, source: nbstatic_notebook::NotebookError) -> ExecutionError {
    ExecutionError::Notebook {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_appends_suffix() {
        assert_eq!(
            temp_path_for(Path::new("/out/python/intro.ipynb")),
            PathBuf::from("/out/python/intro.ipynb.tmp")
        );
    }

    #[test]
    fn test_temp_file_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.ipynb.tmp");
        fs::write(&path, "{}").unwrap();
        drop(TempFile(path.clone()));
        assert!(!path.exists());
        // Dropping again for a missing file is silent
        drop(TempFile(path));
    }

    #[test]
    fn test_remove_if_exists_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_if_exists(&dir.path().join("missing")).is_ok());
    }
}
