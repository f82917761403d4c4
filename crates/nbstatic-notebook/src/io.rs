use crate::document::Notebook;
use crate::error::{NotebookError, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Read a notebook from a file path
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (I/O error)
/// - The notebook JSON is malformed
/// - The notebook is not nbformat 4
pub fn read_notebook<P: AsRef<Path>>(path: P) -> Result<Notebook> {
    let content = fs::read_to_string(path)?;
    notebook_from_str(&content)
}

/// Parse a notebook from its JSON text
///
/// # Errors
///
/// Returns an error if the JSON is malformed, the format version is not 4,
/// or a cell/output does not follow the nbformat 4 schema.
pub fn notebook_from_str(content: &str) -> Result<Notebook> {
    let value: Value = serde_json::from_str(content)?;

    let major = value
        .get("nbformat")
        .and_then(Value::as_u64)
        .ok_or_else(|| NotebookError::InvalidFormat("missing 'nbformat' field".to_string()))?;
    if major != 4 {
        let minor = value
            .get("nbformat_minor")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        return Err(NotebookError::UnsupportedVersion { major, minor });
    }

    Ok(serde_json::from_value(value)?)
}

/// Serialize a notebook the way nbformat lays it out on disk
///
/// One-space indentation, non-ASCII kept verbatim, trailing newline.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn notebook_to_string(notebook: &Notebook) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    notebook.serialize(&mut serializer)?;
    buf.push(b'\n');
    String::from_utf8(buf).map_err(|e| NotebookError::InvalidFormat(e.to_string()))
}

/// Write a notebook to a file path, creating or truncating it
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_notebook<P: AsRef<Path>>(notebook: &Notebook, path: P) -> Result<()> {
    let content = notebook_to_string(notebook)?;
    fs::write(path, content)?;
    Ok(())
}
