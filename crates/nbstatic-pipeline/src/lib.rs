//! # nbstatic-pipeline
//!
//! Turns a tree of Jupyter notebooks into static HTML or Markdown.
//!
//! For each notebook a [`JobRunner`] mirrors its `input/` fixtures, executes
//! it on a fresh kernel, redacts secrets and local paths, and when exporting
//! renders the result with an [`Exporter`] and externalises the inline
//! stylesheet. The [`BatchOrchestrator`] discovers notebooks under the
//! configured roots, skips those already converted and runs the rest on
//! per-root worker pools.
//!
//! ## Example
//!
//! ```no_run
//! use nbstatic_kernel::NotebookExecutor;
//! use nbstatic_pipeline::{
//!     BatchOrchestrator, Config, JobRunner, OutputTarget, PathMapper, Redactor,
//!     StylesheetPublisher,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let base = Path::new("/work/notebooks");
//! let config = Config::discover(None, base)?;
//! let target = OutputTarget::Html;
//! let runner = JobRunner::new(
//!     PathMapper::for_target(base, target),
//!     target,
//!     NotebookExecutor::new(Arc::new(config.launcher(target)), config.executor_options()),
//!     Redactor::for_current_user(),
//!     StylesheetPublisher::new(config.stylesheet_url()),
//! );
//! let summary = BatchOrchestrator::new(runner, config.categories()?).run()?;
//! println!("{} converted, {} failed", summary.succeeded(), summary.failed());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod export;
pub mod inputs;
pub mod job;
pub mod paths;
pub mod publish;
pub mod redact;

pub use batch::{BatchOrchestrator, BatchSummary, Category, CategoryReport};
pub use config::{Config, RootConfig, CONFIG_FILE_NAME, DEFAULT_REQUIRED_ENV, DEFAULT_ROOTS};
pub use error::{ConfigError, ExportError, PathError, PipelineError, Result};
pub use export::{
    export_file, exporter_for, ExportFormat, ExportedDocument, Exporter, HtmlExporter,
    MarkdownExporter, Resources,
};
pub use inputs::{input_files, mirror_inputs, INPUT_DIR};
pub use job::{ConversionJob, JobRunner, JobStatus};
pub use paths::{
    normalize, resource_dir, OutputTarget, PathMapper, GENERATED_ROOTS, HTML_ROOT, MARKDOWN_ROOT,
    STATIC_ROOT,
};
pub use publish::{StylesheetPublisher, DEFAULT_STYLESHEET_URL};
pub use redact::{Redactor, DUMMY_BEARER_TOKEN, HOME_PLACEHOLDER};
