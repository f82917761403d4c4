use super::{
    code_language, image_extension, link_attachments, raw_cell_included, select_mime, strip_ansi,
    unsupported, ExportFormat, Exporter, Resources,
};
use crate::error::ExportError;
use nbstatic_notebook::{Cell, CodeCell, Notebook, Output};

/// Renders notebooks as Markdown documents
///
/// Markdown cells are copied verbatim, code cells fenced with the notebook
/// language and text outputs indented by four spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkdownExporter;

impl MarkdownExporter {
    fn render_code(
        md: &mut String,
        cell_index: usize,
        cell: &CodeCell,
        language: &str,
        resources: &Resources,
    ) -> Result<(), ExportError> {
        let source = cell.source.as_str().trim_end_matches('\n');
        let fence = code_fence(source);
        md.push_str(&format!("{fence}{language}\n{source}\n{fence}\n\n"));

        for (output_index, output) in cell.outputs.iter().enumerate() {
            match output {
                Output::Stream { text, .. } => push_indented(md, &strip_ansi(text.as_str())),
                Output::Error { traceback, .. } => {
                    push_indented(md, &strip_ansi(&traceback.join("\n")));
                }
                Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => {
                    let mime = select_mime(data)
                        .ok_or_else(|| unsupported(cell_index, output_index, data))?;
                    let payload = data.get_text(mime).unwrap_or_default();
                    match mime {
                        "text/html" | "text/markdown" | "text/latex" => {
                            md.push_str(payload.trim_end_matches('\n'));
                            md.push_str("\n\n");
                        }
                        mime if mime.starts_with("image/") => {
                            let key = resources
                                .output_key(cell_index, output_index, mime)
                                .ok_or_else(|| unsupported(cell_index, output_index, data))?;
                            md.push_str(&format!(
                                "![{}]({key})\n\n",
                                image_extension(mime).unwrap_or("image")
                            ));
                        }
                        _ => push_indented(md, &strip_ansi(&payload)),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Backtick fence one longer than any backtick run in `source`, at least three
fn code_fence(source: &str) -> String {
    let longest = source
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    "`".repeat(longest.max(2) + 1)
}

impl Exporter for MarkdownExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Markdown
    }

    fn render(
        &self,
        notebook: &Notebook,
        resources: &Resources,
        _title: &str,
    ) -> Result<String, ExportError> {
        let language = code_language(notebook);
        let mut md = String::with_capacity(8 * 1024);

        for (cell_index, cell) in notebook.cells.iter().enumerate() {
            match cell {
                Cell::Code(code) => {
                    Self::render_code(&mut md, cell_index, code, &language, resources)?;
                }
                Cell::Markdown(text) => {
                    let source = link_attachments(text.source.as_str(), cell_index, resources);
                    md.push_str(source.trim_end_matches('\n'));
                    md.push_str("\n\n");
                }
                Cell::Raw(text) => {
                    if raw_cell_included(text, ExportFormat::Markdown.raw_mime_types()) {
                        md.push_str(text.source.as_str().trim_end_matches('\n'));
                        md.push_str("\n\n");
                    }
                }
            }
        }

        let trimmed = md.trim_end().len();
        md.truncate(trimmed);
        md.push('\n');
        Ok(md)
    }
}

fn push_indented(md: &mut String, text: &str) {
    for line in text.trim_end_matches('\n').lines() {
        if !line.is_empty() {
            md.push_str("    ");
            md.push_str(line);
        }
        md.push('\n');
    }
    md.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbstatic_notebook::MimeBundle;
    use serde_json::json;

    fn code_cell(source: &str, outputs: Vec<Output>) -> Cell {
        let mut cell = Cell::code(source);
        if let Cell::Code(code) = &mut cell {
            code.execution_count = Some(1);
            code.outputs = outputs;
        }
        cell
    }

    fn python_notebook(cells: Vec<Cell>) -> Notebook {
        let mut notebook = Notebook::from_cells(cells);
        notebook
            .metadata
            .insert("language_info".to_string(), json!({"name": "python"}));
        notebook
    }

    #[test]
    fn test_cells_render_in_order() {
        let notebook = python_notebook(vec![
            Cell::markdown("# Title\n"),
            code_cell("print('hi')\n", vec![Output::stream("stdout", "hi\n")]),
        ]);
        let doc = MarkdownExporter.export(&notebook, "t").unwrap();
        assert_eq!(
            doc.body,
            "# Title\n\n```python\nprint('hi')\n```\n\n    hi\n"
        );
    }

    #[test]
    fn test_images_use_resource_keys() {
        let notebook = python_notebook(vec![code_cell(
            "plot()",
            vec![Output::display_data(MimeBundle::text("image/svg+xml", "<svg/>"))],
        )]);
        let doc = MarkdownExporter.export(&notebook, "t").unwrap();
        assert!(doc.body.contains("![svg](output_0_0.svg)"));
    }

    #[test]
    fn test_plain_results_are_indented() {
        let notebook = python_notebook(vec![code_cell(
            "x",
            vec![Output::execute_result(
                MimeBundle::text("text/plain", "line 1\n\nline 3"),
                Some(1),
            )],
        )]);
        let doc = MarkdownExporter.export(&notebook, "t").unwrap();
        assert!(doc.body.ends_with("    line 1\n\n    line 3\n"));
    }

    #[test]
    fn test_html_outputs_are_embedded() {
        let mut data = MimeBundle::text("text/plain", "df");
        data.insert_text("text/html", "<table></table>");
        let notebook = python_notebook(vec![code_cell("df", vec![Output::display_data(data)])]);
        let doc = MarkdownExporter.export(&notebook, "t").unwrap();
        assert!(doc.body.contains("<table></table>"));
        assert!(!doc.body.contains("    df"));
    }

    #[test]
    fn test_fence_outgrows_backticks_in_source() {
        let source = "doc = \"\"\"\n```python\nx = 1\n```\n\"\"\"";
        let notebook = python_notebook(vec![code_cell(source, vec![])]);
        let doc = MarkdownExporter.export(&notebook, "t").unwrap();
        assert!(doc.body.starts_with("````python\n"));
        assert!(doc.body.ends_with("\n````\n"));
        assert_eq!(code_fence("print(1)"), "```");
        assert_eq!(code_fence("a ````` b"), "``````");
    }

    #[test]
    fn test_raw_markdown_cells_pass_through() {
        let mut raw = Cell::raw("**raw**");
        if let Cell::Raw(text) = &mut raw {
            text.metadata
                .insert("raw_mimetype".to_string(), json!("text/markdown"));
        }
        let doc = MarkdownExporter
            .export(&python_notebook(vec![raw, Cell::raw("dropped")]), "t")
            .unwrap();
        assert_eq!(doc.body, "**raw**\n");
    }
}
