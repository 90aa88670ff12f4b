//! In-memory notebook documents.
//!
//! A [`Notebook`] is an ordered list of [`Cell`]s. Code cells carry an
//! execution counter and the [`Output`] records produced by the kernel;
//! markdown, raw and heading cells carry only source text. Documents are read
//! from and written to the nbformat JSON format (versions 3 and 4).
//!
//! This crate is pure data: no I/O, no kernel access.

mod cell;
mod error;
mod format;
mod notebook;
mod output;

pub use cell::{truncate_for_display, Cell, CellBody, CellKey, CellKind, CodeCell, Prompt};
pub use error::DocumentError;
pub use notebook::Notebook;
pub use output::{strip_ansi, MimeBundle, MimeType, Output};

/// Maximum number of characters of output text shown by [`Cell::rendered_output`].
pub const MAX_OUTPUT_CHARS: usize = 5000;

/// Appended to rendered output that was cut at [`MAX_OUTPUT_CHARS`].
pub const TRUNCATION_MARKER: &str = "...";
