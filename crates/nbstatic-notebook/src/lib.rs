//! # nbstatic-notebook
//!
//! Jupyter Notebook (.ipynb, nbformat 4) document model for nbstatic.
//!
//! Unlike a read-only parser, this crate keeps enough of the document to write
//! it back: cell ids, cell and notebook metadata, attachments, the full MIME
//! bundle of every output and any keys the model does not know about survive
//! a read/write cycle unchanged.
//!
//! ## Example
//!
//! ```no_run
//! use nbstatic_notebook::{read_notebook, write_notebook, Cell};
//!
//! let mut notebook = read_notebook("analysis.ipynb")?;
//! for cell in &mut notebook.cells {
//!     if let Cell::Code(code) = cell {
//!         code.outputs.clear();
//!         code.execution_count = None;
//!     }
//! }
//! write_notebook(&notebook, "analysis-clean.ipynb")?;
//! # Ok::<(), nbstatic_notebook::NotebookError>(())
//! ```

/// Error types for notebook I/O
pub mod error;
/// Notebook, cell and output types
pub mod document;
/// Reading and writing `.ipynb` files
pub mod io;

pub use document::{
    Cell, CodeCell, MimeBundle, MultilineText, Notebook, Output, TextCell,
};
pub use error::{NotebookError, Result};
pub use io::{notebook_from_str, notebook_to_string, read_notebook, write_notebook};
