use serde::de::{Deserializer, Error as _};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A Jupyter notebook document (nbformat 4)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    /// Cells in document order
    pub cells: Vec<Cell>,
    /// Notebook-level metadata (kernelspec, language_info, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Major format version
    pub nbformat: u64,
    /// Minor format version
    pub nbformat_minor: u64,
    /// Top-level keys this model does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notebook {
    /// Create an nbformat 4.5 notebook holding the given cells
    #[must_use]
    pub fn from_cells(cells: Vec<Cell>) -> Self {
        Self {
            cells,
            metadata: Map::new(),
            nbformat: 4,
            nbformat_minor: 5,
            extra: Map::new(),
        }
    }

    /// Kernel name from `metadata.kernelspec.name`
    #[must_use]
    pub fn kernel_name(&self) -> Option<&str> {
        self.metadata
            .get("kernelspec")
            .and_then(|ks| ks.get("name"))
            .and_then(Value::as_str)
    }

    /// Programming language name (e.g. "python", "C#")
    ///
    /// Taken from `language_info.name`, falling back to `kernelspec.language`.
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.metadata
            .get("language_info")
            .and_then(|li| li.get("name"))
            .and_then(Value::as_str)
            .or_else(|| {
                self.metadata
                    .get("kernelspec")
                    .and_then(|ks| ks.get("language"))
                    .and_then(Value::as_str)
            })
    }

    /// Notebook title from `metadata.title`, if present
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(Value::as_str)
    }

    /// Iterate over code cells mutably, in document order
    pub fn code_cells_mut(&mut self) -> impl Iterator<Item = &mut CodeCell> {
        self.cells.iter_mut().filter_map(|cell| match cell {
            Cell::Code(code) => Some(code),
            Cell::Markdown(_) | Cell::Raw(_) => None,
        })
    }
}

/// Individual notebook cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum Cell {
    /// Executable code cell
    Code(CodeCell),
    /// Markdown documentation cell
    Markdown(TextCell),
    /// Raw cell, passed through untouched by execution
    Raw(TextCell),
}

impl Cell {
    /// Build a code cell with no outputs
    #[must_use]
    pub fn code(source: impl Into<String>) -> Self {
        Self::Code(CodeCell {
            execution_count: None,
            id: None,
            metadata: Map::new(),
            outputs: Vec::new(),
            source: MultilineText(source.into()),
            extra: Map::new(),
        })
    }

    /// Build a markdown cell
    #[must_use]
    pub fn markdown(source: impl Into<String>) -> Self {
        Self::Markdown(TextCell::new(source))
    }

    /// Build a raw cell
    #[must_use]
    pub fn raw(source: impl Into<String>) -> Self {
        Self::Raw(TextCell::new(source))
    }

    /// Source text of the cell
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Code(code) => &code.source.0,
            Self::Markdown(text) | Self::Raw(text) => &text.source.0,
        }
    }

    /// Cell metadata
    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        match self {
            Self::Code(code) => &code.metadata,
            Self::Markdown(text) | Self::Raw(text) => &text.metadata,
        }
    }
}

/// Code cell with its captured outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeCell {
    /// Execution counter, `null` when never executed
    #[serde(default)]
    pub execution_count: Option<i64>,
    /// Cell identifier (nbformat >= 4.5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Cell metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Outputs in the order they were produced
    #[serde(default)]
    pub outputs: Vec<Output>,
    /// Cell source
    pub source: MultilineText,
    /// Cell keys this model does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Markdown or raw cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCell {
    /// Inline attachments (`attachment:` references)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
    /// Cell identifier (nbformat >= 4.5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Cell metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Cell source
    pub source: MultilineText,
    /// Cell keys this model does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TextCell {
    fn new(source: impl Into<String>) -> Self {
        Self {
            attachments: None,
            id: None,
            metadata: Map::new(),
            source: MultilineText(source.into()),
            extra: Map::new(),
        }
    }
}

/// Cell output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Text written to stdout/stderr
    Stream {
        /// Stream name (`stdout` or `stderr`)
        name: String,
        /// Captured text
        text: MultilineText,
        /// Output keys this model does not know about
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Rich display data (images, HTML, ...)
    DisplayData {
        /// MIME bundle
        data: MimeBundle,
        /// Output metadata
        #[serde(default)]
        metadata: Map<String, Value>,
        /// Output keys this model does not know about
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Value of the trailing expression of a cell
    ExecuteResult {
        /// MIME bundle
        data: MimeBundle,
        /// Execution counter of the producing cell
        #[serde(default)]
        execution_count: Option<i64>,
        /// Output metadata
        #[serde(default)]
        metadata: Map<String, Value>,
        /// Output keys this model does not know about
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Exception raised by the cell
    Error {
        /// Exception class name
        ename: String,
        /// Exception message
        evalue: String,
        /// Formatted traceback lines (may carry ANSI escapes)
        traceback: Vec<String>,
        /// Output keys this model does not know about
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl Output {
    /// Build a stream output
    #[must_use]
    pub fn stream(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Stream {
            name: name.into(),
            text: MultilineText(text.into()),
            extra: Map::new(),
        }
    }

    /// Build an error output
    #[must_use]
    pub fn error(
        ename: impl Into<String>,
        evalue: impl Into<String>,
        traceback: Vec<String>,
    ) -> Self {
        Self::Error {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback,
            extra: Map::new(),
        }
    }

    /// Build a display data output from a MIME bundle
    #[must_use]
    pub fn display_data(data: MimeBundle) -> Self {
        Self::DisplayData {
            data,
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    /// Build an execute result from a MIME bundle
    #[must_use]
    pub fn execute_result(data: MimeBundle, execution_count: Option<i64>) -> Self {
        Self::ExecuteResult {
            data,
            execution_count,
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    /// MIME bundle for display data and execute results
    #[must_use]
    pub const fn data(&self) -> Option<&MimeBundle> {
        match self {
            Self::DisplayData { data, .. } | Self::ExecuteResult { data, .. } => Some(data),
            Self::Stream { .. } | Self::Error { .. } => None,
        }
    }
}

/// MIME-type keyed output payloads
///
/// Text payloads may be stored either as one string or as a list of lines;
/// binary payloads (`image/png`, `image/jpeg`) are base64 strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MimeBundle(pub BTreeMap<String, Value>);

impl MimeBundle {
    /// Build a bundle holding a single text payload
    #[must_use]
    pub fn text(mime: &str, text: impl Into<String>) -> Self {
        let mut bundle = Self::default();
        bundle.insert_text(mime, text);
        bundle
    }

    /// Insert a text payload
    pub fn insert_text(&mut self, mime: &str, text: impl Into<String>) {
        self.0.insert(mime.to_string(), Value::String(text.into()));
    }

    /// Payload for `mime` flattened to a single string
    ///
    /// Line lists are joined; JSON payloads (`application/json`) are
    /// serialized back to text.
    #[must_use]
    pub fn get_text(&self, mime: &str) -> Option<String> {
        match self.0.get(mime)? {
            Value::String(s) => Some(s.clone()),
            Value::Array(lines) => Some(
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<String>(),
            ),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Whether a payload exists for `mime`
    #[must_use]
    pub fn contains(&self, mime: &str) -> bool {
        self.0.contains_key(mime)
    }

    /// MIME types present in the bundle
    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Whether the bundle is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Text that nbformat stores either as a string or as a list of lines
///
/// Always written back as a list of lines, each keeping its trailing `\n`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MultilineText(pub String);

impl MultilineText {
    /// Borrow the joined text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MultilineText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MultilineText {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MultilineText {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Serialize for MultilineText {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let lines: Vec<&str> = self.0.split_inclusive('\n').collect();
        let mut seq = serializer.serialize_seq(Some(lines.len()))?;
        for line in lines {
            seq.serialize_element(line)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for MultilineText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }

        match Repr::deserialize(deserializer) {
            Ok(Repr::One(s)) => Ok(Self(s)),
            Ok(Repr::Many(lines)) => Ok(Self(lines.concat())),
            Err(_) => Err(D::Error::custom(
                "expected a string or a list of strings",
            )),
        }
    }
}
