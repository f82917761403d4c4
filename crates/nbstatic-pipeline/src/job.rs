//! One notebook's end-to-end conversion
//!
//! [`JobRunner::convert`] mirrors inputs, executes, redacts, and in export
//! mode exports and publishes. In export mode the executed notebook is an
//! intermediate file and is deleted whatever the outcome.

use crate::error::{PipelineError, Result};
use crate::export::{export_file, exporter_for, ExportFormat};
use crate::inputs::mirror_inputs;
use crate::paths::{resource_dir, OutputTarget, PathMapper};
use crate::publish::StylesheetPublisher;
use crate::redact::Redactor;
use nbstatic_kernel::NotebookExecutor;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Lifecycle of a conversion job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Paths derived, output not checked yet
    Discovered,
    /// Output already exists
    Skipped,
    /// Waiting for a worker
    Queued,
    /// Picked up by a worker
    Running,
    /// Artifact written
    Succeeded,
    /// Conversion failed with the given cause
    Failed(String),
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Skipped => write!(f, "skipped"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Conversion of one source notebook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    /// Source notebook
    pub source: PathBuf,
    /// Executed notebook written by the executor
    pub executed_path: PathBuf,
    /// Final artifact
    pub output_path: PathBuf,
    /// Extracted resources directory, when exporting
    pub resource_dir: Option<PathBuf>,
    pub status: JobStatus,
}

impl ConversionJob {
    /// Derive every path of the job for `source`
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError::Path`] if `source` cannot be mapped.
    pub fn plan(source: &Path, mapper: &PathMapper, target: OutputTarget) -> Result<Self> {
        let executed_path = mapper.map_executed(source)?;
        let output_path = mapper.map_output(source, target)?;
        let resource_dir = match target.export_format() {
            Some(_) => Some(resource_dir(&output_path)?),
            None => None,
        };
        Ok(Self {
            source: source.to_path_buf(),
            executed_path,
            output_path,
            resource_dir,
            status: JobStatus::Discovered,
        })
    }

    /// Job for a notebook whose paths cannot be derived
    ///
    /// The job is already [`JobStatus::Failed`]; its derived paths are empty.
    #[must_use]
    pub fn unmapped(source: &Path, cause: &PipelineError) -> Self {
        Self {
            source: source.to_path_buf(),
            executed_path: PathBuf::new(),
            output_path: PathBuf::new(),
            resource_dir: None,
            status: JobStatus::Failed(cause.to_string()),
        }
    }

    /// Whether the final artifact already exists
    #[must_use]
    pub fn output_exists(&self) -> bool {
        self.output_path.exists()
    }
}

/// Deletes the intermediate executed notebook when dropped
struct ExecutedNotebook<'a>(&'a Path);

impl Drop for ExecutedNotebook<'_> {
    fn drop(&mut self) {
        match fs::remove_file(self.0) {
            Ok(()) => info!(path = %self.0.display(), "Deleting executed notebook"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.0.display(), "Failed to delete executed notebook: {e}"),
        }
    }
}

/// Runs conversion jobs
#[derive(Debug, Clone)]
pub struct JobRunner {
    mapper: PathMapper,
    target: OutputTarget,
    executor: NotebookExecutor,
    redactor: Redactor,
    publisher: StylesheetPublisher,
}

impl JobRunner {
    #[must_use]
    pub fn new(
        mapper: PathMapper,
        target: OutputTarget,
        executor: NotebookExecutor,
        redactor: Redactor,
        publisher: StylesheetPublisher,
    ) -> Self {
        Self {
            mapper,
            target,
            executor,
            redactor,
            publisher,
        }
    }

    #[must_use]
    pub const fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    #[must_use]
    pub const fn target(&self) -> OutputTarget {
        self.target
    }

    /// Plan the job for `source` with this runner's mapper and target
    ///
    /// # Errors
    ///
    /// See [`ConversionJob::plan`].
    pub fn plan(&self, source: &Path) -> Result<ConversionJob> {
        ConversionJob::plan(source, &self.mapper, self.target)
    }

    /// Run `job`, recording the outcome in its status
    ///
    /// Failures are logged with the notebook path and never propagated.
    pub fn run(&self, job: &mut ConversionJob) {
        job.status = JobStatus::Running;
        let started = Instant::now();
        match self.convert(job) {
            Ok(output) => {
                info!(
                    notebook = %job.source.display(),
                    output = %output.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Converted notebook"
                );
                job.status = JobStatus::Succeeded;
            }
            Err(e) => {
                error!(notebook = %job.source.display(), "Could not convert notebook: {e}");
                job.status = JobStatus::Failed(e.to_string());
            }
        }
    }

    /// Convert the notebook of `job`
    ///
    /// Returns the final artifact path.
    ///
    /// # Errors
    ///
    /// Returns the first [`PipelineError`] raised by any stage.
    pub fn convert(&self, job: &ConversionJob) -> Result<PathBuf> {
        mirror_inputs(&job.source, &self.mapper)?;

        let format = self.target.export_format();
        let _cleanup = format.map(|_| ExecutedNotebook(&job.executed_path));

        info!(
            notebook = %job.source.display(),
            output = %job.executed_path.display(),
            "Executing notebook"
        );
        self.executor.execute_file(&job.source, &job.executed_path)?;

        self.redactor
            .redact_file(&job.executed_path)
            .map_err(|e| PipelineError::io(&job.executed_path, e))?;

        let Some(format) = format else {
            return Ok(job.executed_path.clone());
        };

        info!(notebook = %job.executed_path.display(), format = %format, "Converting notebook");
        let exporter = exporter_for(format);
        let converted = export_file(exporter.as_ref(), &job.executed_path)?;
        if format == ExportFormat::Html {
            self.publisher.publish_file(&converted)?;
        }
        Ok(converted)
    }
}
