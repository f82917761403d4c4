//! Batch conversion of every notebook under the configured roots
//!
//! Each root (category) is discovered, planned and dispatched on its own
//! rayon pool sized by the category's concurrency. Jobs whose output
//! already exists are skipped. A failing job is logged and recorded, and
//! never stops its siblings.

use crate::error::{PipelineError, Result};
use crate::job::{ConversionJob, JobRunner, JobStatus};
use glob::{glob, Pattern};
use rayon::prelude::*;
use std::any::Any;
use std::ffi::OsStr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

const CHECKPOINT_DIR: &str = ".ipynb_checkpoints";

/// A root directory processed with its own worker count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    /// Root directory, relative to the project base unless absolute
    pub root: PathBuf,
    /// Notebooks converted concurrently
    pub concurrency: usize,
}

impl Category {
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            concurrency: concurrency.max(1),
        }
    }
}

/// Jobs of one category after planning or dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: Category,
    pub jobs: Vec<ConversionJob>,
}

impl CategoryReport {
    fn count(&self, predicate: impl Fn(&JobStatus) -> bool) -> usize {
        self.jobs.iter().filter(|job| predicate(&job.status)).count()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|status| *status == JobStatus::Succeeded)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, JobStatus::Failed(_)))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|status| *status == JobStatus::Skipped)
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.count(|status| *status == JobStatus::Queued)
    }
}

/// Outcome of a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub categories: Vec<CategoryReport>,
}

impl BatchSummary {
    /// Every job, in category then discovery order
    pub fn jobs(&self) -> impl Iterator<Item = &ConversionJob> {
        self.categories.iter().flat_map(|report| report.jobs.iter())
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.categories.iter().map(|report| report.jobs.len()).sum()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.categories.iter().map(CategoryReport::succeeded).sum()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.categories.iter().map(CategoryReport::failed).sum()
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.categories.iter().map(CategoryReport::skipped).sum()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.categories.iter().map(CategoryReport::queued).sum()
    }

    /// Jobs that failed
    pub fn failures(&self) -> impl Iterator<Item = &ConversionJob> {
        self.jobs()
            .filter(|job| matches!(job.status, JobStatus::Failed(_)))
    }
}

/// Discovers, plans and dispatches conversion jobs
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    runner: JobRunner,
    categories: Vec<Category>,
}

impl BatchOrchestrator {
    #[must_use]
    pub fn new(runner: JobRunner, categories: Vec<Category>) -> Self {
        Self { runner, categories }
    }

    #[must_use]
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Absolute root directory of `category`
    #[must_use]
    pub fn root_dir(&self, category: &Category) -> PathBuf {
        self.runner.mapper().base().join(&category.root)
    }

    /// Notebooks under the root of `category`, sorted
    ///
    /// Generated trees and `.ipynb_checkpoints` directories are ignored.
    #[must_use]
    pub fn discover(&self, category: &Category) -> Vec<PathBuf> {
        let root = self.root_dir(category);
        info!(category = %category.name, root = %root.display(), "Discovering notebooks");
        if !root.is_dir() {
            debug!(root = %root.display(), "Root directory does not exist");
            return Vec::new();
        }

        let pattern = format!("{}/**/*.ipynb", Pattern::escape(&root.to_string_lossy()));
        let entries = match glob(&pattern) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %root.display(), "Invalid discovery pattern: {e}");
                return Vec::new();
            }
        };

        let mapper = self.runner.mapper();
        let mut notebooks: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping unreadable entry: {e}");
                    None
                }
            })
            .filter(|path| path.is_file())
            .filter(|path| !is_checkpoint(path) && !mapper.is_generated(path))
            .collect();
        notebooks.sort();
        notebooks
    }

    /// Discover and plan the jobs of `category`
    ///
    /// Jobs whose output exists are [`JobStatus::Skipped`], the rest
    /// [`JobStatus::Queued`]. A notebook that cannot be mapped becomes a
    /// [`JobStatus::Failed`] job and planning carries on.
    #[must_use]
    pub fn plan(&self, category: &Category) -> CategoryReport {
        let notebooks = self.discover(category);
        let mut jobs = Vec::with_capacity(notebooks.len());
        for notebook in &notebooks {
            let mut job = match self.runner.plan(notebook) {
                Ok(job) => job,
                Err(e) => {
                    error!(notebook = %notebook.display(), "Could not plan notebook: {e}");
                    jobs.push(ConversionJob::unmapped(notebook, &e));
                    continue;
                }
            };
            if job.output_exists() {
                debug!(
                    notebook = %job.source.display(),
                    output = %job.output_path.display(),
                    "Output already exists, skipping"
                );
                job.status = JobStatus::Skipped;
            } else {
                info!(
                    notebook = %job.source.display(),
                    output = %job.output_path.display(),
                    "Will convert notebook"
                );
                job.status = JobStatus::Queued;
            }
            jobs.push(job);
        }

        let report = CategoryReport {
            category: category.clone(),
            jobs,
        };
        info!(
            category = %category.name,
            "Will process {} not yet converted notebooks (out of {} available)",
            report.queued(),
            report.jobs.len()
        );
        report
    }

    /// Plan every category without dispatching anything
    #[must_use]
    pub fn dry_run(&self) -> BatchSummary {
        let categories = self
            .categories
            .iter()
            .map(|category| self.plan(category))
            .collect();
        BatchSummary { categories }
    }

    /// Convert every queued notebook, category by category
    ///
    /// Returns once every job finished. Individual failures are recorded in
    /// the summary, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error only when a worker pool cannot be built.
    pub fn run(&self) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for category in &self.categories {
            let mut report = self.plan(category);
            self.dispatch(category, &mut report.jobs)?;
            info!(
                category = %category.name,
                succeeded = report.succeeded(),
                failed = report.failed(),
                skipped = report.skipped(),
                "Category finished"
            );
            summary.categories.push(report);
        }
        Ok(summary)
    }

    /// Run the queued jobs of `jobs` on a pool of `category.concurrency` workers
    ///
    /// # Errors
    ///
    /// [`PipelineError::WorkerPool`] if the pool cannot be built.
    pub fn dispatch(&self, category: &Category, jobs: &mut [ConversionJob]) -> Result<()> {
        let queued: Vec<&mut ConversionJob> = jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Queued)
            .collect();
        if queued.is_empty() {
            return Ok(());
        }

        let name = category.name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(category.concurrency)
            .thread_name(move |index| format!("nbstatic-{name}-{index}"))
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;

        info!(
            category = %category.name,
            jobs = queued.len(),
            workers = category.concurrency,
            "Dispatching notebooks"
        );
        pool.install(|| {
            queued
                .into_par_iter()
                .for_each(|job| self.run_isolated(job));
        });
        Ok(())
    }

    fn run_isolated(&self, job: &mut ConversionJob) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(job)));
        if let Err(payload) = outcome {
            let cause = PipelineError::Panicked(panic_message(payload.as_ref()));
            error!(notebook = %job.source.display(), "Could not convert notebook: {cause}");
            job.status = JobStatus::Failed(cause.to_string());
        }
    }
}

fn is_checkpoint(path: &Path) -> bool {
    path.components()
        .any(|component| component == Component::Normal(OsStr::new(CHECKPOINT_DIR)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_concurrency_is_at_least_one() {
        assert_eq!(Category::new("x", "x", 0).concurrency, 1);
    }

    #[test]
    fn test_is_checkpoint() {
        assert!(is_checkpoint(Path::new(
            "/p/python/.ipynb_checkpoints/a-checkpoint.ipynb"
        )));
        assert!(!is_checkpoint(Path::new("/p/python/a.ipynb")));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
