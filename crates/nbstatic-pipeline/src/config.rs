//! Configuration loading for nbstatic.
//!
//! Settings come from an optional `.nbstatic.toml` in the project base.
//! Every field is optional; accessors fall back to the built-in defaults.

use crate::batch::Category;
use crate::error::ConfigError;
use crate::paths::OutputTarget;
use crate::publish::DEFAULT_STYLESHEET_URL;
use nbstatic_kernel::{
    ChainLauncher, ExecutorOptions, JupyterLauncher, KernelCommand, SubprocessLauncher,
    DEFAULT_FOREIGN_HOME, DEFAULT_TIMEOUT, FIGURE_FORMAT_ENV,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the project base
pub const CONFIG_FILE_NAME: &str = ".nbstatic.toml";

/// Environment variable the notebooks need to reach their data services
pub const DEFAULT_REQUIRED_ENV: &str = "AUTH0_TOKEN";

/// Default roots and their worker counts
///
/// .NET interactive kernels fight over listening ports, so those roots run
/// one notebook at a time.
pub const DEFAULT_ROOTS: [(&str, usize); 3] = [("python", 8), ("csharp", 1), ("fsharp", 1)];

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub required_env: Option<Vec<String>>,
    pub stylesheet_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub foreign_home: Option<String>,
    pub roots: Option<Vec<RootConfig>>,
    /// Set to `false` to ignore installed Jupyter kernels
    pub jupyter_kernels: Option<bool>,
    #[serde(default)]
    pub kernels: BTreeMap<String, KernelCommand>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RootConfig {
    pub path: PathBuf,
    pub name: Option<String>,
    pub concurrency: Option<usize>,
}

impl Config {
    /// Parse the config file at `path`
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `explicit` if given, else `<base>/.nbstatic.toml` if present,
    /// else the defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen file cannot be read or parsed. An
    /// explicit path that does not exist is an error.
    pub fn discover(explicit: Option<&Path>, base: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let path = base.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Environment variables that must be set before converting
    pub fn required_env(&self) -> Vec<String> {
        self.required_env
            .clone()
            .unwrap_or_else(|| vec![DEFAULT_REQUIRED_ENV.to_string()])
    }

    /// Fail on the first required variable that `is_set` rejects
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingEnv`] naming the variable.
    pub fn check_environment_with(&self, is_set: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        match self.required_env().into_iter().find(|name| !is_set(name)) {
            Some(name) => Err(ConfigError::MissingEnv(name)),
            None => Ok(()),
        }
    }

    /// Check the required variables against the process environment
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingEnv`] naming the first unset variable.
    pub fn check_environment(&self) -> Result<(), ConfigError> {
        self.check_environment_with(|name| std::env::var_os(name).is_some())
    }

    pub fn stylesheet_url(&self) -> &str {
        self.stylesheet_url
            .as_deref()
            .unwrap_or(DEFAULT_STYLESHEET_URL)
    }

    /// Whole-notebook execution timeout
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs)
    }

    pub fn foreign_home(&self) -> &str {
        self.foreign_home.as_deref().unwrap_or(DEFAULT_FOREIGN_HOME)
    }

    /// Executor settings for the current user
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            timeout: self.timeout(),
            foreign_home: Some(self.foreign_home().to_string()).filter(|home| !home.is_empty()),
            ..ExecutorOptions::default()
        }
    }

    /// Categories to process in batch mode, in configured order
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidRoot`] for an empty path or a zero worker count.
    pub fn categories(&self) -> Result<Vec<Category>, ConfigError> {
        let Some(roots) = &self.roots else {
            return Ok(DEFAULT_ROOTS
                .iter()
                .map(|(path, concurrency)| Category::new(*path, *path, *concurrency))
                .collect());
        };

        roots
            .iter()
            .map(|root| {
                let name = root
                    .name
                    .clone()
                    .unwrap_or_else(|| root.path.to_string_lossy().into_owned());
                if root.path.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidRoot {
                        name,
                        reason: "path is empty".to_string(),
                    });
                }
                let concurrency = root.concurrency.unwrap_or(1);
                if concurrency == 0 {
                    return Err(ConfigError::InvalidRoot {
                        name,
                        reason: "concurrency must be at least 1".to_string(),
                    });
                }
                Ok(Category::new(name, root.path.clone(), concurrency))
            })
            .collect()
    }

    /// Figure format requested from kernels
    ///
    /// SVG for execute-only runs and PNG when the notebook is exported.
    pub const fn figure_format(target: OutputTarget) -> &'static str {
        match target {
            OutputTarget::Notebook => "svg",
            OutputTarget::Html | OutputTarget::Markdown => "png",
        }
    }

    /// Launcher for the `[kernels]` table only
    pub fn configured_launcher(&self, target: OutputTarget) -> SubprocessLauncher {
        self.kernels.iter().fold(
            SubprocessLauncher::empty().with_env(FIGURE_FORMAT_ENV, Self::figure_format(target)),
            |launcher, (name, command)| launcher.with_kernel(name.clone(), command.clone()),
        )
    }

    /// Kernel launcher used for conversions
    ///
    /// Configured kernels come first, then installed Jupyter kernels, then
    /// the embedded Python driver.
    pub fn launcher(&self, target: OutputTarget) -> ChainLauncher {
        let figure_format = Self::figure_format(target);
        let mut chain = ChainLauncher::default().then(self.configured_launcher(target));
        if self.jupyter_kernels.unwrap_or(true) {
            chain = chain.then(JupyterLauncher::default().with_figure_format(figure_format));
        }
        chain.then(SubprocessLauncher::default().with_env(FIGURE_FORMAT_ENV, figure_format))
    }
}
