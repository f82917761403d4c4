//! Notebook export to HTML and Markdown
//!
//! An [`Exporter`] renders an executed notebook to text and collects binary
//! outputs as [`Resources`]. [`export_file`] writes both to disk: resources
//! under `<name>_files/` next to the artifact, with every resource key in the
//! rendered text rewritten to its relative path.

mod html;
mod markdown;

pub use html::{HtmlExporter, NOTEBOOK_CSS};
pub use markdown::MarkdownExporter;

use crate::error::ExportError;
use crate::paths::resource_dir;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use nbstatic_notebook::{read_notebook, Cell, MimeBundle, Notebook, TextCell};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Export target format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Html,
    Markdown,
}

impl ExportFormat {
    /// File extension of the exported artifact
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Markdown => "md",
        }
    }

    /// Raw cell MIME types passed through for this format
    #[must_use]
    pub const fn raw_mime_types(self) -> &'static [&'static str] {
        match self {
            Self::Html => &["text/html"],
            Self::Markdown => &["text/markdown", "text/x-markdown"],
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Html => write!(f, "HTML"),
            Self::Markdown => write!(f, "Markdown"),
        }
    }
}

/// MIME types tried in order when rendering a display output
pub(crate) const DISPLAY_PRIORITY: [&str; 9] = [
    "text/html",
    "text/markdown",
    "image/svg+xml",
    "image/png",
    "image/jpeg",
    "image/gif",
    "text/latex",
    "text/plain",
    "application/json",
];

/// Image MIME types extracted as resources, with their file extension
const EXTRACTED_TYPES: [(&str, &str); 4] = [
    ("image/svg+xml", "svg"),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
];

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").expect("Invalid ANSI escape regex")
});

/// Binary outputs of a notebook, keyed by resource name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    files: BTreeMap<String, Vec<u8>>,
    outputs: HashMap<(usize, usize, String), String>,
    attachments: HashMap<(usize, String), String>,
}

impl Resources {
    /// Collect images from code cell outputs and markdown attachments
    ///
    /// Output images are keyed `output_<cell>_<output>.<ext>`, attachments
    /// `attachment_<cell>_<name>`.
    ///
    /// # Errors
    ///
    /// [`ExportError::InvalidResource`] when a binary payload is not valid
    /// base64.
    pub fn extract(notebook: &Notebook) -> Result<Self, ExportError> {
        let mut resources = Self::default();
        for (cell_index, cell) in notebook.cells.iter().enumerate() {
            match cell {
                Cell::Code(code) => {
                    for (output_index, output) in code.outputs.iter().enumerate() {
                        let Some(data) = output.data() else { continue };
                        for (mime, ext) in EXTRACTED_TYPES {
                            let Some(payload) = data.get_text(mime) else {
                                continue;
                            };
                            let key = format!("output_{cell_index}_{output_index}.{ext}");
                            let bytes = decode_payload(mime, &payload, &key)?;
                            resources
                                .outputs
                                .insert((cell_index, output_index, mime.to_string()), key.clone());
                            resources.files.insert(key, bytes);
                        }
                    }
                }
                Cell::Markdown(text) => resources.extract_attachments(cell_index, text)?,
                Cell::Raw(_) => {}
            }
        }
        Ok(resources)
    }

    fn extract_attachments(&mut self, cell_index: usize, cell: &TextCell) -> Result<(), ExportError> {
        let Some(Value::Object(attachments)) = &cell.attachments else {
            return Ok(());
        };
        for (name, bundle) in attachments {
            let Ok(bundle) = serde_json::from_value::<MimeBundle>(bundle.clone()) else {
                continue;
            };
            let Some((mime, payload)) = EXTRACTED_TYPES
                .iter()
                .find_map(|(mime, _)| bundle.get_text(mime).map(|payload| (*mime, payload)))
            else {
                debug!(cell = cell_index, attachment = %name, "Skipping attachment without image payload");
                continue;
            };
            let key = format!("attachment_{cell_index}_{}", name.replace(['/', '\\'], "_"));
            let bytes = decode_payload(mime, &payload, &key)?;
            self.attachments.insert((cell_index, name.clone()), key.clone());
            self.files.insert(key, bytes);
        }
        Ok(())
    }

    /// Resource key of an extracted output image
    #[must_use]
    pub fn output_key(&self, cell: usize, output: usize, mime: &str) -> Option<&str> {
        self.outputs
            .get(&(cell, output, mime.to_string()))
            .map(String::as_str)
    }

    /// Resource key of a markdown cell attachment
    #[must_use]
    pub fn attachment_key(&self, cell: usize, name: &str) -> Option<&str> {
        self.attachments
            .get(&(cell, name.to_string()))
            .map(String::as_str)
    }

    /// Resource contents by key, in key order
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files
            .iter()
            .map(|(key, bytes)| (key.as_str(), bytes.as_slice()))
    }

    /// Number of resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether there are no resources
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Rendered notebook before it is written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDocument {
    /// Rendered text, referencing resources by key
    pub body: String,
    /// Extracted binary outputs
    pub resources: Resources,
}

/// Renders an executed notebook to a text format
pub trait Exporter: Send + Sync {
    /// Format produced by this exporter
    fn format(&self) -> ExportFormat;

    /// Render `notebook`, referencing extracted images by resource key
    ///
    /// # Errors
    ///
    /// [`ExportError::UnsupportedOutput`] for an output with no renderable
    /// MIME type.
    fn render(
        &self,
        notebook: &Notebook,
        resources: &Resources,
        title: &str,
    ) -> Result<String, ExportError>;

    /// Extract resources and render `notebook`
    ///
    /// # Errors
    ///
    /// See [`Resources::extract`] and [`Exporter::render`].
    fn export(&self, notebook: &Notebook, title: &str) -> Result<ExportedDocument, ExportError> {
        let resources = Resources::extract(notebook)?;
        let body = self.render(notebook, &resources, title)?;
        Ok(ExportedDocument { body, resources })
    }
}

/// Default exporter for `format`
#[must_use]
pub fn exporter_for(format: ExportFormat) -> Box<dyn Exporter> {
    match format {
        ExportFormat::Html => Box::new(HtmlExporter::default()),
        ExportFormat::Markdown => Box::new(MarkdownExporter),
    }
}

/// Export the notebook at `notebook_path` next to itself
///
/// The artifact gets the exporter's extension; resources go to
/// `<name>_files/`, which is removed first. The artifact is written to a
/// temporary file in the same directory and renamed into place.
///
/// Returns the artifact path.
///
/// # Errors
///
/// Returns an [`ExportError`] if the notebook cannot be read or rendered or
/// any file cannot be written.
pub fn export_file(exporter: &dyn Exporter, notebook_path: &Path) -> Result<PathBuf, ExportError> {
    let output_path = notebook_path.with_extension(exporter.format().extension());
    let resource_dir = resource_dir(&output_path)?;
    let folder = resource_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    match fs::remove_dir_all(&resource_dir) {
        Ok(()) => debug!(path = %resource_dir.display(), "Removed previous resources"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(ExportError::io(&resource_dir, e)),
    }

    let notebook = read_notebook(notebook_path).map_err(|source| ExportError::Notebook {
        path: notebook_path.to_path_buf(),
        source,
    })?;
    let title = notebook.title().map_or_else(
        || {
            notebook_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        },
        str::to_string,
    );

    let ExportedDocument {
        mut body,
        resources,
    } = exporter.export(&notebook, &title)?;

    for (key, bytes) in resources.files() {
        let resource_path = resource_dir.join(key);
        fs::create_dir_all(&resource_dir).map_err(|e| ExportError::io(&resource_dir, e))?;
        info!(resource = key, path = %resource_path.display(), "Writing converted notebook resource");
        fs::write(&resource_path, bytes).map_err(|e| ExportError::io(&resource_path, e))?;
        body = body.replace(key, &format!("{folder}/{key}"));
    }

    info!(path = %output_path.display(), "Writing converted notebook");
    write_atomic(&output_path, body.as_bytes())?;
    Ok(output_path)
}

/// Write `contents` through a temporary file renamed onto `path`
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ExportError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| ExportError::io(dir, e))?;
    if let Err(e) = file.write_all(contents).and_then(|()| file.flush()) {
        return Err(ExportError::io(file.path(), e));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(|e| ExportError::io(path, e))?;
    }
    file.persist(path)
        .map_err(|e| ExportError::io(path, e.error))?;
    Ok(())
}

fn decode_payload(mime: &str, payload: &str, key: &str) -> Result<Vec<u8>, ExportError> {
    if mime == "image/svg+xml" {
        return Ok(payload.as_bytes().to_vec());
    }
    let compact: String = payload.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| ExportError::InvalidResource {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

/// First MIME type of `bundle` in display priority order
pub(crate) fn select_mime(bundle: &MimeBundle) -> Option<&'static str> {
    DISPLAY_PRIORITY
        .into_iter()
        .find(|mime| bundle.contains(mime))
}

pub(crate) fn unsupported(cell: usize, output: usize, bundle: &MimeBundle) -> ExportError {
    ExportError::UnsupportedOutput {
        cell,
        output,
        mime_types: bundle.mime_types().collect::<Vec<_>>().join(", "),
    }
}

/// File extension of an extracted image type
pub(crate) fn image_extension(mime: &str) -> Option<&'static str> {
    EXTRACTED_TYPES
        .iter()
        .find(|(candidate, _)| *candidate == mime)
        .map(|(_, ext)| *ext)
}

/// Whether a raw cell targets one of `mime_types`
pub(crate) fn raw_cell_included(cell: &TextCell, mime_types: &[&str]) -> bool {
    ["raw_mimetype", "format"].iter().any(|field| {
        cell.metadata
            .get(*field)
            .and_then(Value::as_str)
            .is_some_and(|mime| mime_types.iter().any(|m| m.eq_ignore_ascii_case(mime)))
    })
}

/// Replace `attachment:<name>` references with resource keys
pub(crate) fn link_attachments<'a>(
    source: &'a str,
    cell_index: usize,
    resources: &Resources,
) -> Cow<'a, str> {
    let mut text = Cow::Borrowed(source);
    for ((cell, name), key) in &resources.attachments {
        if *cell != cell_index {
            continue;
        }
        let reference = format!("attachment:{name}");
        if text.contains(&reference) {
            text = Cow::Owned(text.replace(&reference, key));
        }
    }
    text
}

/// Remove terminal color codes
pub(crate) fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// Fence/highlight language for the notebook's kernel language
pub(crate) fn code_language(notebook: &Notebook) -> String {
    match notebook.language().map(str::to_lowercase).as_deref() {
        Some("c#") => "csharp".to_string(),
        Some("f#") => "fsharp".to_string(),
        Some("powershell" | "pwsh") => "powershell".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbstatic_notebook::Output;
    use serde_json::json;

    const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn display(bundle: &[(&str, &str)]) -> Output {
        let mut data = MimeBundle::default();
        for (mime, payload) in bundle {
            data.insert_text(mime, *payload);
        }
        Output::display_data(data)
    }

    fn notebook_with_outputs(outputs: Vec<Output>) -> Notebook {
        let mut cell = Cell::code("plot()");
        if let Cell::Code(code) = &mut cell {
            code.outputs = outputs;
        }
        Notebook::from_cells(vec![Cell::markdown("# Plot"), cell])
    }

    #[test]
    fn test_extract_keys_by_cell_and_output() {
        let notebook = notebook_with_outputs(vec![
            Output::stream("stdout", "hi\n"),
            display(&[("image/png", PIXEL_PNG), ("text/plain", "<Figure>")]),
            display(&[("image/svg+xml", "<svg></svg>")]),
        ]);
        let resources = Resources::extract(&notebook).unwrap();

        assert_eq!(resources.len(), 2);
        assert_eq!(resources.output_key(1, 1, "image/png"), Some("output_1_1.png"));
        assert_eq!(resources.output_key(1, 2, "image/svg+xml"), Some("output_1_2.svg"));
        let files: Vec<_> = resources.files().collect();
        assert_eq!(files[0].0, "output_1_1.png");
        assert!(files[0].1.starts_with(b"\x89PNG"));
        assert_eq!(files[1], ("output_1_2.svg", b"<svg></svg>".as_slice()));
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let notebook = notebook_with_outputs(vec![display(&[("image/png", "not base64!")])]);
        let err = Resources::extract(&notebook).unwrap_err();
        assert!(matches!(err, ExportError::InvalidResource { ref key, .. } if key == "output_1_0.png"));
    }

    #[test]
    fn test_base64_with_line_breaks_decodes() {
        let wrapped = format!("{}\n{}", &PIXEL_PNG[..20], &PIXEL_PNG[20..]);
        let notebook = notebook_with_outputs(vec![display(&[("image/png", wrapped.as_str())])]);
        assert_eq!(Resources::extract(&notebook).unwrap().len(), 1);
    }

    #[test]
    fn test_attachments_are_extracted() {
        let mut cell = Cell::markdown("![chart](attachment:chart.png)");
        if let Cell::Markdown(text) = &mut cell {
            text.attachments = Some(json!({"chart.png": {"image/png": PIXEL_PNG}}));
        }
        let notebook = Notebook::from_cells(vec![cell]);
        let resources = Resources::extract(&notebook).unwrap();
        assert_eq!(resources.attachment_key(0, "chart.png"), Some("attachment_0_chart.png"));
        assert_eq!(
            link_attachments("![chart](attachment:chart.png)", 0, &resources),
            "![chart](attachment_0_chart.png)"
        );
    }

    #[test]
    fn test_select_mime_priority() {
        let mut bundle = MimeBundle::text("text/plain", "x");
        assert_eq!(select_mime(&bundle), Some("text/plain"));
        bundle.insert_text("image/png", PIXEL_PNG);
        assert_eq!(select_mime(&bundle), Some("image/png"));
        bundle.insert_text("text/html", "<b>x</b>");
        assert_eq!(select_mime(&bundle), Some("text/html"));
        assert_eq!(
            select_mime(&MimeBundle::text("application/vnd.widget+json", "{}")),
            None
        );
    }

    #[test]
    fn test_raw_cell_inclusion() {
        let mut cell = Cell::raw("<b>raw</b>");
        let Cell::Raw(text) = &mut cell else {
            unreachable!()
        };
        assert!(!raw_cell_included(text, ExportFormat::Html.raw_mime_types()));
        text.metadata
            .insert("raw_mimetype".to_string(), json!("text/html"));
        assert!(raw_cell_included(text, ExportFormat::Html.raw_mime_types()));
        assert!(!raw_cell_included(text, ExportFormat::Markdown.raw_mime_types()));
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(
            strip_ansi("\x1b[0;31mZeroDivisionError\x1b[0m: division by zero"),
            "ZeroDivisionError: division by zero"
        );
    }

    #[test]
    fn test_code_language() {
        let mut notebook = Notebook::from_cells(Vec::new());
        assert_eq!(code_language(&notebook), "");
        notebook
            .metadata
            .insert("language_info".to_string(), json!({"name": "C#"}));
        assert_eq!(code_language(&notebook), "csharp");
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.html");
        fs::write(&path, "old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
