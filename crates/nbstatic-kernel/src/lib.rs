//! # nbstatic-kernel
//!
//! Notebook execution for nbstatic.
//!
//! - [`kernel`]: the [`Kernel`]/[`KernelLauncher`] seam between the executor
//!   and whatever runtime executes cells
//! - [`jupyter`]: installed Jupyter kernels (`kernel.json`) driven over
//!   ZeroMQ, framed by [`wire`]
//! - [`subprocess`]: kernels as child processes speaking a JSON-lines protocol,
//!   with an embedded Python driver used when no Jupyter kernel is installed
//! - [`executor`]: [`NotebookExecutor`], which runs a notebook file end to end
//!
//! ## Example
//!
//! ```no_run
//! use nbstatic_kernel::{
//!     ChainLauncher, ExecutorOptions, JupyterLauncher, NotebookExecutor, SubprocessLauncher,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let launcher = ChainLauncher::default()
//!     .then(JupyterLauncher::default())
//!     .then(SubprocessLauncher::default());
//! let executor = NotebookExecutor::new(
//!     Arc::new(launcher),
//!     ExecutorOptions::default(),
//! );
//! executor.execute_file(
//!     Path::new("python/intro.ipynb"),
//!     Path::new("_generated_static/python/intro.ipynb"),
//! )?;
//! # Ok::<(), nbstatic_kernel::ExecutionError>(())
//! ```

/// Error types for kernels and execution
pub mod error;
/// Notebook executor
pub mod executor;
/// Jupyter kernels over ZeroMQ
pub mod jupyter;
/// Kernel traits
pub mod kernel;
/// Child-process kernels
pub mod subprocess;
/// Jupyter message framing and output collection
pub mod wire;

pub use error::{ExecutionError, KernelError, Result};
pub use executor::{
    temp_path_for, ExecutorOptions, NotebookExecutor, DEFAULT_FOREIGN_HOME, DEFAULT_TIMEOUT,
    TEMP_SUFFIX,
};
pub use jupyter::{
    find_kernelspecs, jupyter_data_dirs, InstalledKernel, JupyterKernel, JupyterLauncher,
    CONNECTION_FILE_PLACEHOLDER, DEFAULT_STARTUP_TIMEOUT, RESOURCE_DIR_PLACEHOLDER,
};
pub use kernel::{
    CellFailure, CellReply, ChainLauncher, Kernel, KernelLauncher, KernelSpec, DEFAULT_KERNEL,
};
pub use subprocess::{
    KernelCommand, SubprocessKernel, SubprocessLauncher, DRIVER_PLACEHOLDER, FIGURE_FORMAT_ENV,
    PYTHON_DRIVER,
};
