use super::{
    code_language, image_extension, link_attachments, raw_cell_included, select_mime, strip_ansi,
    unsupported, ExportFormat, Exporter, Resources,
};
use crate::error::ExportError;
use nbstatic_notebook::{Cell, CodeCell, Notebook, Output};
use pulldown_cmark::{html, Options, Parser};

/// Stylesheet inlined into every exported page
pub const NOTEBOOK_CSS: &str = r#"
body { margin: 0; font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; font-size: 14px; line-height: 1.5; color: #212121; }
main.jp-Notebook { max-width: 1000px; margin: 0 auto; padding: 16px; }
.jp-Cell { margin: 8px 0; }
.jp-InputArea, .jp-OutputArea-child { display: flex; }
.jp-InputPrompt, .jp-OutputPrompt { flex: 0 0 80px; padding: 4px; font-family: monospace; font-size: 12px; text-align: right; color: #616161; }
.jp-InputPrompt { color: #307fc1; }
.jp-OutputPrompt { color: #bf5b3d; }
.jp-CodeMirrorEditor { flex: 1; margin: 0; padding: 6px; overflow-x: auto; background: #f5f5f5; border: 1px solid #e0e0e0; border-radius: 2px; }
.jp-OutputArea-output { flex: 1; margin: 0; padding: 4px 6px; overflow-x: auto; }
.jp-OutputArea-output pre, pre.jp-OutputArea-output { font-family: monospace; white-space: pre-wrap; }
.jp-RenderedText[data-mime-type="application/vnd.jupyter.stderr"] { background: #fdd; }
.jp-RenderedText[data-mime-type="application/vnd.jupyter.error"] { background: #fdd; }
.jp-RenderedImage img { max-width: 100%; height: auto; }
.jp-MarkdownCell { padding-left: 88px; }
.jp-MarkdownCell table { border-collapse: collapse; }
.jp-MarkdownCell th, .jp-MarkdownCell td, .jp-RenderedHTML th, .jp-RenderedHTML td { padding: 4px 8px; border: 1px solid #e0e0e0; }
"#;

/// Renders notebooks as standalone HTML pages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlExporter {
    stylesheet: String,
}

impl Default for HtmlExporter {
    fn default() -> Self {
        Self::with_stylesheet(NOTEBOOK_CSS)
    }
}

impl HtmlExporter {
    /// Exporter inlining `stylesheet` in the page head
    #[must_use]
    pub fn with_stylesheet(stylesheet: impl Into<String>) -> Self {
        Self {
            stylesheet: stylesheet.into(),
        }
    }

    fn render_code(
        &self,
        html: &mut String,
        cell_index: usize,
        cell: &CodeCell,
        language: &str,
        resources: &Resources,
    ) -> Result<(), ExportError> {
        html.push_str("<div class=\"jp-Cell jp-CodeCell\">\n<div class=\"jp-InputArea\">\n");
        html.push_str(&format!(
            "<div class=\"jp-InputPrompt\">In&nbsp;[{}]:</div>\n",
            prompt_number(cell.execution_count)
        ));
        html.push_str(&format!(
            "<pre class=\"jp-CodeMirrorEditor\"><code class=\"language-{}\">{}</code></pre>\n</div>\n",
            escape_html(language),
            escape_html(cell.source.as_str())
        ));

        if !cell.outputs.is_empty() {
            html.push_str("<div class=\"jp-OutputArea\">\n");
            for (output_index, output) in cell.outputs.iter().enumerate() {
                self.render_output(html, cell_index, output_index, output, resources)?;
            }
            html.push_str("</div>\n");
        }
        html.push_str("</div>\n");
        Ok(())
    }

    fn render_output(
        &self,
        html: &mut String,
        cell_index: usize,
        output_index: usize,
        output: &Output,
        resources: &Resources,
    ) -> Result<(), ExportError> {
        let prompt = match output {
            Output::ExecuteResult {
                execution_count, ..
            } => format!("Out[{}]:", prompt_number(*execution_count)),
            _ => String::new(),
        };
        html.push_str(&format!(
            "<div class=\"jp-OutputArea-child\">\n<div class=\"jp-OutputPrompt\">{prompt}</div>\n"
        ));

        match output {
            Output::Stream { name, text, .. } => {
                let mime = if name == "stderr" {
                    "application/vnd.jupyter.stderr"
                } else {
                    "application/vnd.jupyter.stdout"
                };
                html.push_str(&format!(
                    "<pre class=\"jp-RenderedText jp-OutputArea-output\" data-mime-type=\"{mime}\">{}</pre>\n",
                    escape_html(&strip_ansi(text.as_str()))
                ));
            }
            Output::Error { traceback, .. } => {
                html.push_str(&format!(
                    "<pre class=\"jp-RenderedText jp-OutputArea-output\" data-mime-type=\"application/vnd.jupyter.error\">{}</pre>\n",
                    escape_html(&strip_ansi(&traceback.join("\n")))
                ));
            }
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => {
                let mime = select_mime(data)
                    .ok_or_else(|| unsupported(cell_index, output_index, data))?;
                let payload = data.get_text(mime).unwrap_or_default();
                match mime {
                    "text/html" => {
                        html.push_str("<div class=\"jp-RenderedHTML jp-OutputArea-output\">\n");
                        html.push_str(&payload);
                        html.push_str("\n</div>\n");
                    }
                    "text/markdown" => {
                        html.push_str("<div class=\"jp-RenderedMarkdown jp-OutputArea-output\">\n");
                        html.push_str(&markdown_to_html(&payload));
                        html.push_str("</div>\n");
                    }
                    "text/latex" => {
                        html.push_str(&format!(
                            "<div class=\"jp-RenderedLatex jp-OutputArea-output\">{}</div>\n",
                            escape_html(&payload)
                        ));
                    }
                    mime if mime.starts_with("image/") => {
                        let key = resources
                            .output_key(cell_index, output_index, mime)
                            .ok_or_else(|| unsupported(cell_index, output_index, data))?;
                        html.push_str(&format!(
                            "<div class=\"jp-RenderedImage jp-OutputArea-output\"><img src=\"{key}\" alt=\"{}\" /></div>\n",
                            image_extension(mime).unwrap_or("image")
                        ));
                    }
                    _ => {
                        html.push_str(&format!(
                            "<pre class=\"jp-RenderedText jp-OutputArea-output\" data-mime-type=\"{mime}\">{}</pre>\n",
                            escape_html(&strip_ansi(&payload))
                        ));
                    }
                }
            }
        }
        html.push_str("</div>\n");
        Ok(())
    }
}

impl Exporter for HtmlExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Html
    }

    fn render(
        &self,
        notebook: &Notebook,
        resources: &Resources,
        title: &str,
    ) -> Result<String, ExportError> {
        let language = code_language(notebook);
        let mut html = String::with_capacity(16 * 1024);
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\" />\n");
        html.push_str(
            "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\" />\n",
        );
        html.push_str(&format!("<title>{}</title>\n", escape_html(title)));
        html.push_str("<style type=\"text/css\">");
        html.push_str(&self.stylesheet);
        html.push_str("</style>\n</head>\n<body>\n<main class=\"jp-Notebook\">\n");

        for (cell_index, cell) in notebook.cells.iter().enumerate() {
            match cell {
                Cell::Code(code) => {
                    self.render_code(&mut html, cell_index, code, &language, resources)?;
                }
                Cell::Markdown(text) => {
                    let source = link_attachments(text.source.as_str(), cell_index, resources);
                    html.push_str("<div class=\"jp-Cell jp-MarkdownCell\">\n");
                    html.push_str(&markdown_to_html(&source));
                    html.push_str("</div>\n");
                }
                Cell::Raw(text) => {
                    if raw_cell_included(text, ExportFormat::Html.raw_mime_types()) {
                        html.push_str(text.source.as_str());
                        html.push('\n');
                    }
                }
            }
        }

        html.push_str("</main>\n</body>\n</html>\n");
        Ok(html)
    }
}

fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_FOOTNOTES);

    let parser = Parser::new_ext(markdown, options);
    let mut html_output = String::new();
    html::push_html(&mut html_output, parser);
    html_output
}

fn prompt_number(execution_count: Option<i64>) -> String {
    execution_count.map_or_else(|| " ".to_string(), |n| n.to_string())
}

/// Escape text for HTML element content and attribute values
#[must_use]
pub(crate) fn escape_html(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#39;"),
            _ => result.push(ch),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbstatic_notebook::MimeBundle;
    use serde_json::json;

    fn code_cell(source: &str, execution_count: Option<i64>, outputs: Vec<Output>) -> Cell {
        let mut cell = Cell::code(source);
        if let Cell::Code(code) = &mut cell {
            code.execution_count = execution_count;
            code.outputs = outputs;
        }
        cell
    }

    fn render(notebook: &Notebook) -> Result<String, ExportError> {
        HtmlExporter::default()
            .export(notebook, "Intro")
            .map(|doc| doc.body)
    }

    #[test]
    fn test_page_has_one_inline_stylesheet() {
        let html = render(&Notebook::from_cells(vec![Cell::markdown("# Hello")])).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert_eq!(html.matches("<style type=\"text/css\">").count(), 1);
        assert!(html.contains("<title>Intro</title>"));
        assert!(html.contains("<h1>Hello</h1>"));
    }

    #[test]
    fn test_code_cell_is_escaped_with_prompt() {
        let notebook = Notebook::from_cells(vec![code_cell(
            "if a < b:\n    print('x')",
            Some(3),
            vec![Output::stream("stdout", "<ok>\n")],
        )]);
        let html = render(&notebook).unwrap();
        assert!(html.contains("In&nbsp;[3]:"));
        assert!(html.contains("if a &lt; b:"));
        assert!(html.contains("&lt;ok&gt;"));
    }

    #[test]
    fn test_execute_result_html_is_verbatim() {
        let mut data = MimeBundle::text("text/plain", "df");
        data.insert_text("text/html", "<table><tr><td>1</td></tr></table>");
        let notebook = Notebook::from_cells(vec![code_cell(
            "df",
            Some(1),
            vec![Output::execute_result(data, Some(1))],
        )]);
        let html = render(&notebook).unwrap();
        assert!(html.contains("Out[1]:"));
        assert!(html.contains("<table><tr><td>1</td></tr></table>"));
    }

    #[test]
    fn test_images_reference_resource_keys() {
        let notebook = Notebook::from_cells(vec![
            Cell::markdown("intro"),
            code_cell(
                "plot()",
                Some(1),
                vec![Output::display_data(MimeBundle::text("image/svg+xml", "<svg></svg>"))],
            ),
        ]);
        let doc = HtmlExporter::default().export(&notebook, "Plot").unwrap();
        assert!(doc.body.contains("<img src=\"output_1_0.svg\" alt=\"svg\" />"));
        assert_eq!(doc.resources.len(), 1);
    }

    #[test]
    fn test_traceback_is_stripped_of_ansi() {
        let notebook = Notebook::from_cells(vec![code_cell(
            "1 / 0",
            Some(1),
            vec![Output::error(
                "ZeroDivisionError",
                "division by zero",
                vec!["\x1b[0;31mZeroDivisionError\x1b[0m: division by zero".to_string()],
            )],
        )]);
        let html = render(&notebook).unwrap();
        assert!(html.contains(">ZeroDivisionError: division by zero</pre>"));
        assert!(!html.contains('\x1b'));
    }

    #[test]
    fn test_unrenderable_output_fails() {
        let notebook = Notebook::from_cells(vec![code_cell(
            "widget",
            Some(1),
            vec![Output::display_data(MimeBundle::text("application/vnd.jupyter.widget-view+json", "{}"))],
        )]);
        let err = render(&notebook).unwrap_err();
        assert!(matches!(
            err,
            ExportError::UnsupportedOutput { cell: 0, output: 0, .. }
        ));
    }

    #[test]
    fn test_raw_cells_need_matching_mimetype() {
        let mut raw = Cell::raw("<aside>raw</aside>");
        let plain = Cell::raw("<aside>dropped</aside>");
        if let Cell::Raw(text) = &mut raw {
            text.metadata
                .insert("raw_mimetype".to_string(), json!("text/html"));
        }
        let html = render(&Notebook::from_cells(vec![raw, plain])).unwrap();
        assert!(html.contains("<aside>raw</aside>"));
        assert!(!html.contains("dropped"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }
}
