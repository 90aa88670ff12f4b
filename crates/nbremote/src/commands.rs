//! Subcommand handlers. Each one logs in, does its work and, when it started
//! a kernel, shuts it down again before returning.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kernel_session::{
    CellObserver, ExecutionController, ExecutionEvent, KernelSession, ReplyStatus, RunCell,
    ServerConfig,
};
use log::{debug, info, warn};
use notebook_doc::{Cell, Notebook, Output};

use crate::render;

pub fn connect(config: ServerConfig) -> Result<KernelSession> {
    let session = KernelSession::new(config)?;
    session.login().context("logging in")?;
    Ok(session)
}

pub fn list(session: &KernelSession, json: bool) -> Result<()> {
    let entries = session.list_notebooks()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No notebooks found");
    } else {
        println!("{}", render::notebook_table(&entries));
    }
    Ok(())
}

pub fn new(session: &KernelSession) -> Result<()> {
    let id = session.new_notebook()?;
    println!("{}", id);
    Ok(())
}

pub fn show(session: &KernelSession, notebook_id: &str, json: bool) -> Result<()> {
    let notebook = session.open(notebook_id)?;
    if json {
        println!("{}", notebook.to_json()?);
    } else {
        print!("{}", render::notebook_text(&notebook));
    }
    Ok(())
}

pub fn export(session: &KernelSession, notebook_id: &str, path: &Path, as_text: bool) -> Result<()> {
    let notebook = session.open(notebook_id)?;
    render::write_export(&notebook, path, as_text)?;
    info!("[nbremote] Exported {} to {}", notebook_id, path.display());
    Ok(())
}

/// Prints what the kernel sends besides cell outputs.
#[derive(Default)]
struct ConsoleObserver;

impl CellObserver for ConsoleObserver {
    fn prompt_changed(&mut self, cell: &Cell) {
        debug!("[nbremote] prompt [{}]", cell.prompt_label());
    }

    fn pager(&mut self, text: &str) {
        eprintln!("{}", text);
    }

    fn next_input(&mut self, _cell: &Cell, text: &str) {
        eprintln!("next input: {}", text);
    }
}

pub struct RunOptions {
    pub cells: Vec<usize>,
    pub save: bool,
    pub timeout: Option<Duration>,
}

/// Run cells one after another, printing each as it completes.
pub fn run(session: KernelSession, notebook_id: &str, options: RunOptions) -> Result<()> {
    let session = Arc::new(session);
    let mut notebook = session.open(notebook_id)?;
    session.start()?;

    let result = run_cells(&session, &mut notebook, &options);
    let saved = match (&result, options.save) {
        (Ok(()), true) => session.save(&notebook).context("saving notebook"),
        _ => Ok(()),
    };
    stop_kernel(&session);
    result.and(saved)
}

fn run_cells(session: &Arc<KernelSession>, notebook: &mut Notebook, options: &RunOptions) -> Result<()> {
    let targets: Vec<usize> = if options.cells.is_empty() {
        (0..notebook.cell_count())
            .filter(|&i| notebook.get_cell(i).map(Cell::is_code).unwrap_or(false))
            .collect()
    } else {
        options.cells.clone()
    };

    let mut controller = ExecutionController::new(session.clone(), ConsoleObserver);
    for index in targets {
        match controller.run_cell(notebook, index)? {
            RunCell::Started => {}
            RunCell::NotCode => {
                warn!("[nbremote] Cell {} is not a code cell, skipping", index);
                continue;
            }
            RunCell::AlreadyRunning => continue,
        }
        if !controller.wait(notebook, options.timeout) {
            session.interrupt()?;
            bail!("cell {} did not finish in time", index);
        }
        print!("{}", render::cell_text(index, notebook.get_cell(index)?));
    }
    Ok(())
}

/// Run `code` in the notebook's kernel and stream its outputs.
pub fn exec(session: KernelSession, notebook_id: &str, code: &str) -> Result<()> {
    session.open(notebook_id)?;
    session.start()?;
    let result = stream_execution(&session, code);
    stop_kernel(&session);
    result
}

fn stream_execution(session: &KernelSession, code: &str) -> Result<()> {
    let mut execution = session.run(code)?;
    let mut stdout = std::io::stdout();
    while let Some(event) = execution.next_blocking() {
        match event {
            ExecutionEvent::Output(output) => {
                let text = render::output_text(&output);
                match output {
                    Output::Stream { name, .. } if name == "stderr" => eprint!("{}", text),
                    Output::Error { .. } => eprint!("{}", text),
                    _ => print!("{}", text),
                }
                stdout.flush()?;
            }
            // A terminal cannot take back what it printed.
            ExecutionEvent::ClearOutput { .. } => {}
            ExecutionEvent::Finished(outcome) => {
                if let Some(pager) = outcome.pager {
                    eprintln!("{}", pager);
                }
                if outcome.status != ReplyStatus::Ok {
                    bail!(
                        "execution finished with status {}",
                        render::status_label(&outcome.status)
                    );
                }
                return Ok(());
            }
            ExecutionEvent::Failed(err) => return Err(err.into()),
        }
    }
    bail!("kernel connection ended before the reply")
}

pub fn complete(
    session: KernelSession,
    notebook_id: &str,
    line: &str,
    cursor: Option<usize>,
    timeout: Duration,
) -> Result<()> {
    session.open(notebook_id)?;
    session.start()?;
    let cursor = cursor.unwrap_or_else(|| line.chars().count());
    for candidate in session.complete(line, cursor, Some(timeout)) {
        println!("{}", candidate);
    }
    stop_kernel(&session);
    Ok(())
}

fn stop_kernel(session: &KernelSession) {
    if let Err(e) = session.shutdown() {
        warn!("[nbremote] Failed to shut down kernel: {}", e);
    }
}
