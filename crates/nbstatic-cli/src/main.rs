//! nbstatic command-line interface

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nbstatic_kernel::NotebookExecutor;
use nbstatic_pipeline::{
    BatchOrchestrator, BatchSummary, Config, JobRunner, JobStatus, OutputTarget, PathMapper,
    Redactor, StylesheetPublisher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Verbosity level for output control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Verbosity {
    /// Warnings and errors only
    Quiet,
    /// Normal output (default)
    Normal,
    /// Debug output
    Verbose,
}

impl Verbosity {
    /// Create from CLI flags
    const fn from_flags(quiet: bool, verbose: bool) -> Self {
        if quiet {
            Self::Quiet
        } else if verbose {
            Self::Verbose
        } else {
            Self::Normal
        }
    }

    /// Default log filter when `RUST_LOG` is unset
    const fn default_filter(self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Normal => "info",
            Self::Verbose => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
enum TargetArg {
    /// Execute only, keep the executed notebook
    Notebook,
    /// Export to HTML
    Html,
    /// Export to Markdown
    Markdown,
}

impl From<TargetArg> for OutputTarget {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Notebook => Self::Notebook,
            TargetArg::Html => Self::Html,
            TargetArg::Markdown => Self::Markdown,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "nbstatic",
    about = "Execute Jupyter notebooks and publish them as static HTML or Markdown",
    version
)]
struct Args {
    /// Only show warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Config file (default: .nbstatic.toml in the project base, if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Project base directory (default: current directory)
    #[arg(long, global = true, value_name = "DIR")]
    base: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert one notebook, or every notebook under the configured roots
    #[command(long_about = "Convert notebooks.\n\
                      \n\
                      With a NOTEBOOK argument, that notebook is converted unconditionally.\n\
                      Without one, every notebook under the configured roots whose output does\n\
                      not exist yet is converted, each root on its own worker pool.")]
    Convert {
        /// Notebook to convert (default: batch mode)
        #[arg(value_name = "NOTEBOOK")]
        notebook: Option<PathBuf>,

        /// Export to HTML (same as --format html)
        #[arg(long, conflicts_with = "format")]
        html: bool,

        /// Output format (default: notebook)
        #[arg(short, long, value_enum)]
        format: Option<TargetArg>,

        /// Whole-notebook execution timeout in seconds (default: 600, or from config)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Show what would be converted without converting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the paths a notebook maps to
    Map {
        /// Source notebook
        #[arg(value_name = "NOTEBOOK")]
        notebook: PathBuf,

        /// Map as for HTML export (same as --format html)
        #[arg(long, conflicts_with = "format")]
        html: bool,

        /// Output format (default: notebook)
        #[arg(short, long, value_enum)]
        format: Option<TargetArg>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let verbosity = Verbosity::from_flags(args.quiet, args.verbose);
    init_logging(verbosity);

    let base = resolve_base(args.base.as_deref())?;
    let config = Config::discover(args.config.as_deref(), &base)?;
    debug!(base = %base.display(), "Loaded configuration");

    match args.command {
        Commands::Convert {
            notebook,
            html,
            format,
            timeout,
            dry_run,
        } => {
            let target = resolve_target(html, format);
            convert_command(&config, &base, notebook.as_deref(), target, timeout, dry_run)
        }
        Commands::Map {
            notebook,
            html,
            format,
        } => map_command(&base, &notebook, resolve_target(html, format)),
    }
}

fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_target(html: bool, format: Option<TargetArg>) -> OutputTarget {
    if html {
        OutputTarget::Html
    } else {
        format.map_or(OutputTarget::Notebook, OutputTarget::from)
    }
}

fn resolve_base(base: Option<&Path>) -> Result<PathBuf> {
    let base = match base {
        Some(base) => base.to_path_buf(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    base.canonicalize()
        .with_context(|| format!("Project base not found: {}", base.display()))
}

/// Absolute, symlink-free form of `path`, resolved against `base` when relative
fn resolve_notebook(base: &Path, path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_or_else(|_| base.join(path), |cwd| cwd.join(path))
    };
    absolute
        .canonicalize()
        .with_context(|| format!("Notebook not found: {}", path.display()))
}

fn build_runner(config: &Config, base: &Path, target: OutputTarget, timeout: Option<u64>) -> JobRunner {
    let mut options = config.executor_options();
    if let Some(secs) = timeout {
        options.timeout = Duration::from_secs(secs);
    }
    JobRunner::new(
        PathMapper::for_target(base, target),
        target,
        NotebookExecutor::new(Arc::new(config.launcher(target)), options),
        Redactor::for_current_user(),
        StylesheetPublisher::new(config.stylesheet_url()),
    )
}

fn convert_command(
    config: &Config,
    base: &Path,
    notebook: Option<&Path>,
    target: OutputTarget,
    timeout: Option<u64>,
    dry_run: bool,
) -> Result<()> {
    config
        .check_environment()
        .context("Notebooks need their data service credentials")?;

    let runner = build_runner(config, base, target, timeout);
    info!(base = %base.display(), target = %target, "Converting notebooks");

    let Some(notebook) = notebook else {
        let orchestrator = BatchOrchestrator::new(runner, config.categories()?);
        let summary = if dry_run {
            orchestrator.dry_run()
        } else {
            orchestrator.run()?
        };
        print_summary(&summary, dry_run);
        return Ok(());
    };

    let source = resolve_notebook(base, notebook)?;
    let job = runner.plan(&source)?;
    if dry_run {
        println!(
            "Would convert {} to {}",
            job.source.display(),
            job.output_path.display()
        );
        return Ok(());
    }
    let output = runner
        .convert(&job)
        .with_context(|| format!("Could not convert {}", source.display()))?;
    println!("{}", output.display());
    Ok(())
}

fn print_summary(summary: &BatchSummary, dry_run: bool) {
    for report in &summary.categories {
        for job in &report.jobs {
            match &job.status {
                JobStatus::Queued if dry_run => println!(
                    "Would convert {} to {}",
                    job.source.display(),
                    job.output_path.display()
                ),
                JobStatus::Failed(cause) => {
                    println!("Failed {}: {cause}", job.source.display());
                }
                _ => {}
            }
        }
    }

    if dry_run {
        println!(
            "{} to convert, {} already converted",
            summary.queued(),
            summary.skipped()
        );
    } else {
        println!(
            "{} converted, {} failed, {} skipped",
            summary.succeeded(),
            summary.failed(),
            summary.skipped()
        );
    }
}

fn map_command(base: &Path, notebook: &Path, target: OutputTarget) -> Result<()> {
    let source = resolve_notebook(base, notebook)?;
    let mapper = PathMapper::for_target(base, target);
    let job = nbstatic_pipeline::ConversionJob::plan(&source, &mapper, target)?;

    println!("executed: {}", job.executed_path.display());
    println!("output: {}", job.output_path.display());
    if let Some(dir) = &job.resource_dir {
        println!("resources: {}", dir.display());
    }
    Ok(())
}
