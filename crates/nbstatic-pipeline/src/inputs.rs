//! Mirroring of notebook input fixtures into the generated tree
//!
//! A notebook may read files from an `input/` directory beside it. Those
//! files are copied to their mapped location before execution so the
//! notebook finds them relative to its working directory.

use crate::error::{PipelineError, Result};
use crate::paths::PathMapper;
use glob::{glob, Pattern};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the fixture directory next to a notebook
pub const INPUT_DIR: &str = "input";

/// Files under the `input/` directory next to `notebook`, sorted
///
/// Empty when there is no such directory.
#[must_use]
pub fn input_files(notebook: &Path) -> Vec<PathBuf> {
    let Some(input_dir) = notebook.parent().map(|dir| dir.join(INPUT_DIR)) else {
        return Vec::new();
    };
    if !input_dir.is_dir() {
        return Vec::new();
    }

    let pattern = format!(
        "{}/**/*",
        Pattern::escape(&input_dir.to_string_lossy())
    );
    let entries = match glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %input_dir.display(), "Invalid input pattern: {e}");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable input entry: {e}");
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

/// Copy the input fixtures of `notebook` to their mapped paths
///
/// Returns the number of files copied.
///
/// # Errors
///
/// Returns a [`PipelineError`] if a fixture falls outside the project base
/// or cannot be copied.
pub fn mirror_inputs(notebook: &Path, mapper: &PathMapper) -> Result<usize> {
    let files = input_files(notebook);
    for file in &files {
        let copy = mapper.map_input_file(file)?;
        info!(input = %file.display(), copy = %copy.display(), "Copying input file");
        if let Some(dir) = copy.parent() {
            fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        }
        fs::copy(file, &copy).map_err(|e| PipelineError::io(file, e))?;
    }
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::STATIC_ROOT;

    #[test]
    fn test_missing_input_dir_copies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let notebook = dir.path().join("python").join("a.ipynb");
        let mapper = PathMapper::new(dir.path(), STATIC_ROOT);
        assert_eq!(mirror_inputs(&notebook, &mapper).unwrap(), 0);
    }

    #[test]
    fn test_inputs_are_copied_recursively_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("python").join("Pairs [Demo]");
        fs::create_dir_all(folder.join("input").join("Daily Data")).unwrap();
        fs::write(folder.join("input").join("Prices.csv"), "a,b\n").unwrap();
        fs::write(
            folder.join("input").join("Daily Data").join("x.json"),
            "{}",
        )
        .unwrap();
        let notebook = folder.join("Pairs.ipynb");

        let mapper = PathMapper::new(dir.path(), STATIC_ROOT);
        assert_eq!(mirror_inputs(&notebook, &mapper).unwrap(), 2);

        let generated = dir.path().join(STATIC_ROOT).join("python").join("pairs-demo");
        assert_eq!(
            fs::read_to_string(generated.join("input").join("prices.csv")).unwrap(),
            "a,b\n"
        );
        assert!(generated
            .join("input")
            .join("daily-data")
            .join("x.json")
            .is_file());
    }
}
