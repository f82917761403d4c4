//! Kernel abstraction
//!
//! A [`Kernel`] is one fresh runtime executing the code cells of a single
//! notebook, in order, sharing state between cells. A [`KernelLauncher`]
//! starts kernels; it receives the working directory explicitly so that
//! parallel workers never have to change the process-wide current directory.

use crate::error::{KernelError, Result};
use nbstatic_notebook::{Notebook, Output};
use std::path::Path;
use std::time::Duration;

/// Kernel name used when a notebook declares none
pub const DEFAULT_KERNEL: &str = "python3";

/// Identity of the kernel a notebook asks for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelSpec {
    /// Kernel name (`kernelspec.name`)
    pub name: String,
    /// Language name, used as a fallback when no command matches `name`
    pub language: Option<String>,
}

impl KernelSpec {
    /// Build a spec from a kernel name only
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: None,
        }
    }

    /// Kernel requested by a notebook's metadata
    ///
    /// Falls back to the language name, then to [`DEFAULT_KERNEL`].
    #[must_use]
    pub fn from_notebook(notebook: &Notebook) -> Self {
        let language = notebook.language().map(str::to_string);
        let name = notebook
            .kernel_name()
            .map(str::to_string)
            .or_else(|| language.clone())
            .unwrap_or_else(|| DEFAULT_KERNEL.to_string());
        Self { name, language }
    }
}

/// Exception details reported by a failing cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFailure {
    /// Exception class name
    pub ename: String,
    /// Exception message
    pub evalue: String,
    /// Traceback lines
    pub traceback: Vec<String>,
}

/// Result of running one cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellReply {
    /// Outputs produced by the cell, including its error output if any
    pub outputs: Vec<Output>,
    /// Set when the cell raised
    pub failure: Option<CellFailure>,
}

impl CellReply {
    /// Successful cell
    #[must_use]
    pub const fn ok(outputs: Vec<Output>) -> Self {
        Self {
            outputs,
            failure: None,
        }
    }

    /// Failed cell; appends the matching error output after `outputs`
    #[must_use]
    pub fn failed(mut outputs: Vec<Output>, failure: CellFailure) -> Self {
        outputs.push(Output::error(
            failure.ename.clone(),
            failure.evalue.clone(),
            failure.traceback.clone(),
        ));
        Self {
            outputs,
            failure: Some(failure),
        }
    }
}

/// A running kernel
pub trait Kernel: Send {
    /// Run one cell and wait at most `timeout` for its reply
    ///
    /// # Errors
    ///
    /// Returns an error when the kernel dies, times out or replies garbage.
    /// A cell raising an exception is not an error: it is reported through
    /// [`CellReply::failure`].
    fn execute(&mut self, code: &str, execution_count: i64, timeout: Duration)
        -> Result<CellReply>;

    /// Stop the kernel
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel process could not be reaped.
    fn shutdown(&mut self) -> Result<()>;
}

/// Starts kernels
pub trait KernelLauncher: Send + Sync {
    /// Start a fresh kernel for `spec`, running in `working_dir`
    ///
    /// # Errors
    ///
    /// Returns an error if no kernel matches `spec` or it fails to start.
    fn launch(&self, spec: &KernelSpec, working_dir: &Path) -> Result<Box<dyn Kernel>>;
}

/// Tries launchers in order, moving on while they do not know the kernel
///
/// Any other launch failure stops the search.
#[derive(Default)]
pub struct ChainLauncher {
    launchers: Vec<Box<dyn KernelLauncher>>,
}

impl ChainLauncher {
    /// Append `launcher` after the ones already in the chain
    #[must_use]
    pub fn then(mut self, launcher: impl KernelLauncher + 'static) -> Self {
        self.launchers.push(Box::new(launcher));
        self
    }
}

impl KernelLauncher for ChainLauncher {
    fn launch(&self, spec: &KernelSpec, working_dir: &Path) -> Result<Box<dyn Kernel>> {
        for launcher in &self.launchers {
            match launcher.launch(spec, working_dir) {
                Err(KernelError::UnknownKernel(_)) => continue,
                other => return other,
            }
        }
        Err(KernelError::UnknownKernel(spec.name.clone()))
    }
}
