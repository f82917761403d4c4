//! Source notebook path to generated artifact path mapping
//!
//! Mapping is a pure function of the source path, the project base and the
//! generated root name. Nothing here touches the filesystem: callers
//! canonicalise paths before mapping them.

use crate::error::PathError;
use crate::export::ExportFormat;
use std::path::{Component, Path, PathBuf};

/// Generated root for execute-only runs
pub const STATIC_ROOT: &str = "_generated_static";
/// Generated root for HTML runs
pub const HTML_ROOT: &str = "_generated_html";
/// Generated root for Markdown runs
pub const MARKDOWN_ROOT: &str = "_generated_md";

/// Every generated root name, skipped by discovery
pub const GENERATED_ROOTS: [&str; 3] = [STATIC_ROOT, HTML_ROOT, MARKDOWN_ROOT];

/// What a conversion produces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OutputTarget {
    /// Executed notebook only
    #[default]
    Notebook,
    /// Executed notebook exported to HTML
    Html,
    /// Executed notebook exported to Markdown
    Markdown,
}

impl OutputTarget {
    /// Generated root directory name used for this target
    #[must_use]
    pub const fn generated_root(self) -> &'static str {
        match self {
            Self::Notebook => STATIC_ROOT,
            Self::Html => HTML_ROOT,
            Self::Markdown => MARKDOWN_ROOT,
        }
    }

    /// Export format, `None` in execute-only mode
    #[must_use]
    pub const fn export_format(self) -> Option<ExportFormat> {
        match self {
            Self::Notebook => None,
            Self::Html => Some(ExportFormat::Html),
            Self::Markdown => Some(ExportFormat::Markdown),
        }
    }
}

impl std::fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Notebook => "notebook",
            Self::Html => "html",
            Self::Markdown => "markdown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutputTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "notebook" | "ipynb" | "static" => Ok(Self::Notebook),
            "html" => Ok(Self::Html),
            "markdown" | "md" => Ok(Self::Markdown),
            _ => Err(format!(
                "Unknown output target '{s}'. Expected one of: notebook, html, markdown"
            )),
        }
    }
}

/// Maps source paths under a project base into a generated root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    base: PathBuf,
    generated_root: String,
}

impl PathMapper {
    /// Mapper writing under `<base>/<generated_root>`
    #[must_use]
    pub fn new(base: impl Into<PathBuf>, generated_root: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            generated_root: generated_root.into(),
        }
    }

    /// Mapper using the generated root of `target`
    #[must_use]
    pub fn for_target(base: impl Into<PathBuf>, target: OutputTarget) -> Self {
        Self::new(base, target.generated_root())
    }

    /// Project base directory
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Absolute generated root directory
    #[must_use]
    pub fn generated_root(&self) -> PathBuf {
        self.base.join(&self.generated_root)
    }

    /// Path of the executed notebook for `source`
    ///
    /// # Errors
    ///
    /// [`PathError::OutsideBase`] when `source` is not under the base.
    pub fn map_executed(&self, source: &Path) -> Result<PathBuf, PathError> {
        let relative = self.relative(source)?;
        Ok(self.generated_root().join(normalize(&relative)))
    }

    /// Final artifact path for `source`
    ///
    /// Same as [`PathMapper::map_executed`] with the extension replaced by the
    /// export format's when `target` exports.
    ///
    /// # Errors
    ///
    /// [`PathError::OutsideBase`] when `source` is not under the base.
    pub fn map_output(&self, source: &Path, target: OutputTarget) -> Result<PathBuf, PathError> {
        let executed = self.map_executed(source)?;
        Ok(match target.export_format() {
            Some(format) => executed.with_extension(format.extension()),
            None => executed,
        })
    }

    /// Destination of a mirrored input fixture
    ///
    /// # Errors
    ///
    /// [`PathError::OutsideBase`] when `path` is not under the base.
    pub fn map_input_file(&self, path: &Path) -> Result<PathBuf, PathError> {
        self.map_executed(path)
    }

    /// Whether `path` lies inside one of the generated roots
    #[must_use]
    pub fn is_generated(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.base).unwrap_or(path);
        relative.components().any(|component| match component {
            Component::Normal(name) => name
                .to_str()
                .is_some_and(|name| name == self.generated_root || GENERATED_ROOTS.contains(&name)),
            _ => false,
        })
    }

    fn relative(&self, source: &Path) -> Result<PathBuf, PathError> {
        let relative = if source.is_absolute() {
            source
                .strip_prefix(&self.base)
                .map_err(|_| self.outside(source))?
        } else {
            source
        };

        let mut clean = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(name) => clean.push(name),
                _ => return Err(self.outside(source)),
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(PathError::NoFileName(source.to_path_buf()));
        }
        Ok(clean)
    }

    fn outside(&self, source: &Path) -> PathError {
        PathError::OutsideBase {
            path: source.to_path_buf(),
            base: self.base.clone(),
        }
    }
}

/// Resource directory of an exported artifact: `<dir>/<stem>_files`
///
/// # Errors
///
/// [`PathError::NoFileName`] when `artifact` has no file stem.
pub fn resource_dir(artifact: &Path) -> Result<PathBuf, PathError> {
    let stem = artifact
        .file_stem()
        .ok_or_else(|| PathError::NoFileName(artifact.to_path_buf()))?;
    Ok(artifact.with_file_name(format!("{}_files", stem.to_string_lossy())))
}

/// Lower-case, drop `[` and `]`, replace spaces with `-`
#[must_use]
pub fn normalize(relative: &Path) -> PathBuf {
    let normalized: String = relative
        .to_string_lossy()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '[' | ']'))
        .map(|c| if c == ' ' { '-' } else { c })
        .collect();
    PathBuf::from(normalized)
}
