//! The notebook document: an ordered list of cells plus format metadata.

use serde_json::{Map, Value};

use crate::cell::{Cell, CellKey, CellKind};
use crate::error::DocumentError;

/// How cells are laid out in the persisted JSON.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Layout {
    /// nbformat 4: top-level `cells`.
    Cells,
    /// nbformat 3: `worksheets[0].cells`. `first` holds the remaining keys of
    /// the first worksheet (`None` if the file had no worksheets), `rest` the
    /// other worksheets verbatim.
    Worksheets {
        first: Option<Map<String, Value>>,
        rest: Vec<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notebook {
    pub nbformat: u32,
    pub nbformat_minor: u32,
    pub(crate) cells: Vec<Cell>,
    pub(crate) layout: Layout,
    /// Top-level keys other than the format version and cells (`metadata`, ...).
    pub extra: Map<String, Value>,
}

impl Default for Notebook {
    fn default() -> Self {
        Self::new()
    }
}

impl Notebook {
    /// An empty nbformat 4 notebook.
    pub fn new() -> Self {
        let mut extra = Map::new();
        extra.insert("metadata".to_string(), Value::Object(Map::new()));
        Self {
            nbformat: 4,
            nbformat_minor: 4,
            cells: Vec::new(),
            layout: Layout::Cells,
            extra,
        }
    }

    /// An empty nbformat 3 notebook with a single worksheet.
    pub fn new_v3() -> Self {
        let mut extra = Map::new();
        extra.insert("metadata".to_string(), serde_json::json!({ "name": "" }));
        let mut worksheet = Map::new();
        worksheet.insert("metadata".to_string(), Value::Object(Map::new()));
        Self {
            nbformat: 3,
            nbformat_minor: 0,
            cells: Vec::new(),
            layout: Layout::Worksheets {
                first: Some(worksheet),
                rest: Vec::new(),
            },
            extra,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn get_cell(&self, index: usize) -> Result<&Cell, DocumentError> {
        let len = self.cells.len();
        self.cells
            .get(index)
            .ok_or(DocumentError::IndexOutOfRange { index, len })
    }

    pub fn get_cell_mut(&mut self, index: usize) -> Result<&mut Cell, DocumentError> {
        let len = self.cells.len();
        self.cells
            .get_mut(index)
            .ok_or(DocumentError::IndexOutOfRange { index, len })
    }

    /// Insert a fresh cell of `kind` at `index` (`0..=len`).
    pub fn insert_cell(&mut self, index: usize, kind: CellKind) -> Result<&mut Cell, DocumentError> {
        let mut cell = Cell::new(kind);
        cell.extra = self.fresh_cell_extra(kind);
        self.insert(index, cell)
    }

    /// Insert an existing cell at `index` (`0..=len`).
    pub fn insert(&mut self, index: usize, cell: Cell) -> Result<&mut Cell, DocumentError> {
        let len = self.cells.len();
        if index > len {
            return Err(DocumentError::IndexOutOfRange { index, len });
        }
        self.cells.insert(index, cell);
        Ok(&mut self.cells[index])
    }

    /// Append a cell at the end.
    pub fn push(&mut self, cell: Cell) -> &mut Cell {
        self.cells.push(cell);
        let last = self.cells.len() - 1;
        &mut self.cells[last]
    }

    /// Remove and return the cell at `index` (`0..len`).
    pub fn delete_cell(&mut self, index: usize) -> Result<Cell, DocumentError> {
        let len = self.cells.len();
        if index >= len {
            return Err(DocumentError::IndexOutOfRange { index, len });
        }
        Ok(self.cells.remove(index))
    }

    /// Move the cell at `from` so that it ends up at index `to`.
    pub fn move_cell(&mut self, from: usize, to: usize) -> Result<(), DocumentError> {
        let len = self.cells.len();
        if from >= len {
            return Err(DocumentError::IndexOutOfRange { index: from, len });
        }
        if to >= len {
            return Err(DocumentError::IndexOutOfRange { index: to, len });
        }
        let cell = self.cells.remove(from);
        self.cells.insert(to, cell);
        Ok(())
    }

    pub fn position(&self, key: CellKey) -> Option<usize> {
        self.cells.iter().position(|c| c.key() == key)
    }

    pub fn cell_by_key(&self, key: CellKey) -> Option<&Cell> {
        self.cells.iter().find(|c| c.key() == key)
    }

    pub fn cell_by_key_mut(&mut self, key: CellKey) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.key() == key)
    }

    /// Keys a freshly created cell carries in this document's format version.
    fn fresh_cell_extra(&self, kind: CellKind) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("metadata".to_string(), Value::Object(Map::new()));
        if self.nbformat < 4 && kind == CellKind::Code {
            extra.insert("collapsed".to_string(), Value::Bool(false));
            extra.insert("language".to_string(), Value::String("python".to_string()));
        }
        extra
    }
}
