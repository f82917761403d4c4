//! Inline stylesheet externalisation for exported HTML
//!
//! Exported pages inline the whole notebook stylesheet. For publishing, the
//! first inline `<style type="text/css">` block is replaced by a link to a
//! shared stylesheet and any further blocks are dropped.

use crate::export::write_atomic;
use crate::error::ExportError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Stylesheet linked from published pages unless configured otherwise
pub const DEFAULT_STYLESHEET_URL: &str = "http://systemathics.io/stylesheets/jupyter.css";

static INLINE_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<\s*style\s+type\s*=\s*"text/css"\s*>.*?<\s*/\s*style\s*>"#)
        .expect("Invalid inline style regex")
});

/// Replaces inline stylesheets with a link to an external one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StylesheetPublisher {
    link: String,
}

impl Default for StylesheetPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_STYLESHEET_URL)
    }
}

impl StylesheetPublisher {
    /// Publisher linking to `stylesheet_url`
    #[must_use]
    pub fn new(stylesheet_url: &str) -> Self {
        Self {
            link: format!(
                r#"<link rel="stylesheet" type="text/css" href="{}" />"#,
                stylesheet_url.replace('&', "&amp;").replace('"', "&quot;")
            ),
        }
    }

    /// The `<link>` tag inserted in place of the first inline stylesheet
    #[must_use]
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Externalise inline stylesheets in `html`
    ///
    /// Borrowed when there is nothing to replace.
    #[must_use]
    pub fn process<'a>(&self, html: &'a str) -> Cow<'a, str> {
        let mut first = true;
        INLINE_STYLE.replace_all(html, |_: &Captures<'_>| {
            if first {
                first = false;
                self.link.clone()
            } else {
                String::new()
            }
        })
    }

    /// Process the HTML file at `path` in place
    ///
    /// The file is only rewritten when its content changed. Returns whether
    /// it was.
    ///
    /// # Errors
    ///
    /// [`ExportError::Io`] if the file cannot be read or written.
    pub fn publish_file(&self, path: &Path) -> Result<bool, ExportError> {
        info!(path = %path.display(), "Reworking");
        let html = fs::read_to_string(path).map_err(|e| ExportError::io(path, e))?;
        match self.process(&html) {
            Cow::Borrowed(_) => {
                debug!(path = %path.display(), "No inline stylesheet found");
                Ok(false)
            }
            Cow::Owned(published) => {
                write_atomic(path, published.as_bytes())?;
                Ok(true)
            }
        }
    }
}
