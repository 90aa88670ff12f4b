//! Plain-text views of notebooks for the terminal.

use std::path::Path;

use anyhow::{Context, Result};
use kernel_session::{NotebookEntry, ReplyStatus};
use notebook_doc::{truncate_for_display, Cell, CellBody, Notebook, Output};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct NotebookRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "KERNEL")]
    kernel: String,
}

impl From<&NotebookEntry> for NotebookRow {
    fn from(entry: &NotebookEntry) -> Self {
        NotebookRow {
            id: entry.id.clone(),
            name: entry.name.clone(),
            kernel: entry.kernel_id.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub fn notebook_table(entries: &[NotebookEntry]) -> String {
    let rows: Vec<NotebookRow> = entries.iter().map(NotebookRow::from).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn status_label(status: &ReplyStatus) -> &'static str {
    match status {
        ReplyStatus::Ok => "ok",
        ReplyStatus::Error => "error",
        ReplyStatus::Aborted => "aborted",
    }
}

/// Text of one output; rich outputs without `text/plain` show their MIME types.
pub fn output_text(output: &Output) -> String {
    if let Some(text) = output.plain_text() {
        return truncate_for_display(&text).into_owned();
    }
    let mimes: Vec<&str> = output
        .data()
        .map(|data| data.mime_types().map(|m| m.as_str()).collect())
        .unwrap_or_default();
    format!("[{}]\n", mimes.join(", "))
}

pub fn cell_text(index: usize, cell: &Cell) -> String {
    match &cell.body {
        CellBody::Code(_) => {
            let mut text = format!("In [{}] #{}:\n{}\n", cell.prompt_label(), index, cell.source);
            let rendered = cell.rendered_output();
            if !rendered.is_empty() {
                text.push_str("Out:\n");
                text.push_str(&rendered);
                if !rendered.ends_with('\n') {
                    text.push('\n');
                }
            }
            text
        }
        CellBody::Heading { level } => {
            format!("{} {}\n", "#".repeat(usize::from(*level)), cell.source)
        }
        CellBody::Markdown | CellBody::Raw => format!("{}\n", cell.source),
    }
}

pub fn notebook_text(notebook: &Notebook) -> String {
    notebook
        .cells()
        .iter()
        .enumerate()
        .map(|(index, cell)| cell_text(index, cell))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write `notebook` to `path` as nbformat JSON, or as plain text with `as_text`.
pub fn write_export(notebook: &Notebook, path: &Path, as_text: bool) -> Result<()> {
    let body = if as_text {
        notebook_text(notebook)
    } else {
        notebook.to_json()?
    };
    std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}
