//! Notebook cells.

use std::borrow::Cow;
use std::fmt;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::output::Output;
use crate::{MAX_OUTPUT_CHARS, TRUNCATION_MARKER};

/// Stable in-memory identity of a cell.
///
/// Indices shift as cells are inserted and deleted; the key does not. Keys
/// are never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKey(Uuid);

impl CellKey {
    pub(crate) fn new() -> Self {
        CellKey(Uuid::new_v4())
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
    Heading,
}

impl CellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
            CellKind::Heading => "heading",
        }
    }

    /// Parse an nbformat `cell_type`. The never-released `plaintext` name maps to raw.
    pub fn parse(cell_type: &str) -> Option<Self> {
        match cell_type {
            "code" => Some(CellKind::Code),
            "markdown" => Some(CellKind::Markdown),
            "raw" | "plaintext" => Some(CellKind::Raw),
            "heading" => Some(CellKind::Heading),
            _ => None,
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution counter of a code cell ("prompt number").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prompt {
    #[default]
    Unset,
    /// Transient marker while a run is outstanding. Not persisted.
    Running,
    Count(i64),
}

impl Prompt {
    pub fn count(self) -> Option<i64> {
        match self {
            Prompt::Count(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Unset => f.write_str(" "),
            Prompt::Running => f.write_str("*"),
            Prompt::Count(n) => write!(f, "{}", n),
        }
    }
}

/// State only code cells carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeCell {
    pub prompt: Prompt,
    pub outputs: Vec<Output>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellBody {
    Code(CodeCell),
    Markdown,
    Raw,
    Heading { level: u8 },
}

#[derive(Debug, Clone)]
pub struct Cell {
    key: CellKey,
    pub source: String,
    pub body: CellBody,
    /// Keys the model does not interpret (`metadata`, `collapsed`, `id`, ...),
    /// written back untouched.
    pub extra: Map<String, Value>,
}

/// Equality ignores the in-memory key.
impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.body == other.body && self.extra == other.extra
    }
}

impl Cell {
    pub fn new(kind: CellKind) -> Self {
        let body = match kind {
            CellKind::Code => CellBody::Code(CodeCell::default()),
            CellKind::Markdown => CellBody::Markdown,
            CellKind::Raw => CellBody::Raw,
            CellKind::Heading => CellBody::Heading { level: 1 },
        };
        Self::from_parts(String::new(), body, Map::new())
    }

    pub fn code(source: &str) -> Self {
        let mut cell = Self::new(CellKind::Code);
        cell.source = source.to_string();
        cell
    }

    pub fn markdown(source: &str) -> Self {
        let mut cell = Self::new(CellKind::Markdown);
        cell.source = source.to_string();
        cell
    }

    pub fn heading(source: &str, level: u8) -> Self {
        Self::from_parts(source.to_string(), CellBody::Heading { level }, Map::new())
    }

    pub(crate) fn from_parts(source: String, body: CellBody, extra: Map<String, Value>) -> Self {
        Self {
            key: CellKey::new(),
            source,
            body,
            extra,
        }
    }

    pub fn key(&self) -> CellKey {
        self.key
    }

    pub fn kind(&self) -> CellKind {
        match self.body {
            CellBody::Code(_) => CellKind::Code,
            CellBody::Markdown => CellKind::Markdown,
            CellBody::Raw => CellKind::Raw,
            CellBody::Heading { .. } => CellKind::Heading,
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self.body, CellBody::Code(_))
    }

    pub fn as_code(&self) -> Option<&CodeCell> {
        match &self.body {
            CellBody::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut CodeCell> {
        match &mut self.body {
            CellBody::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Outputs of a code cell; empty for every other kind.
    pub fn outputs(&self) -> &[Output] {
        self.as_code().map(|c| c.outputs.as_slice()).unwrap_or(&[])
    }

    pub fn prompt(&self) -> Prompt {
        self.as_code().map(|c| c.prompt).unwrap_or_default()
    }

    /// Label shown next to the input: `"*"`, the counter, or `" "`.
    pub fn prompt_label(&self) -> String {
        self.prompt().to_string()
    }

    /// Text view of all outputs, truncated for display.
    ///
    /// The stored outputs are never modified.
    pub fn rendered_output(&self) -> String {
        let combined: String = self
            .outputs()
            .iter()
            .filter_map(Output::plain_text)
            .collect();
        truncate_for_display(&combined).into_owned()
    }
}

/// Cut `text` to [`MAX_OUTPUT_CHARS`] characters, appending [`TRUNCATION_MARKER`]
/// when anything was removed.
pub fn truncate_for_display(text: &str) -> Cow<'_, str> {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => Cow::Owned(format!("{}{}", &text[..cut], TRUNCATION_MARKER)),
        None => Cow::Borrowed(text),
    }
}
