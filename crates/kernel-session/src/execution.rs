//! Running notebook cells through a session.
//!
//! The controller never touches the document from a background task. Events
//! for every running cell are merged into one queue and applied on the
//! caller's thread by [`ExecutionController::pump`] or
//! [`ExecutionController::wait`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use notebook_doc::{Cell, CellKey, DocumentError, Notebook, Output, Prompt};
use tokio::sync::mpsc;

use crate::reply::ExecutionEvent;
use crate::session::KernelSession;

/// Notified as cells change. Every method runs on the thread that called
/// `run_cell`, `pump` or `wait`.
pub trait CellObserver {
    fn outputs_changed(&mut self, _cell: &Cell) {}

    fn prompt_changed(&mut self, _cell: &Cell) {}

    /// Text the kernel wants shown in a pager.
    fn pager(&mut self, _text: &str) {}

    /// The kernel proposed `text` as the next cell's source.
    fn next_input(&mut self, _cell: &Cell, _text: &str) {}
}

impl CellObserver for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCell {
    Started,
    /// Markdown, raw and heading cells have nothing to run.
    NotCode,
    /// The cell already has a request in flight; nothing was sent.
    AlreadyRunning,
}

pub struct ExecutionController<O = ()> {
    session: Arc<KernelSession>,
    observer: O,
    /// Running cells and the `msg_id` of their request.
    running: HashMap<CellKey, String>,
    /// Cells that asked for their outputs to be cleared on the next output.
    clear_pending: HashSet<CellKey>,
    events_tx: mpsc::UnboundedSender<(CellKey, ExecutionEvent)>,
    events_rx: mpsc::UnboundedReceiver<(CellKey, ExecutionEvent)>,
}

impl<O: CellObserver> ExecutionController<O> {
    pub fn new(session: Arc<KernelSession>, observer: O) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session,
            observer,
            running: HashMap::new(),
            clear_pending: HashSet::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn session(&self) -> &Arc<KernelSession> {
        &self.session
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn is_running(&self, key: CellKey) -> bool {
        self.running.contains_key(&key)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Send the cell at `index` to the kernel.
    ///
    /// The cell is marked running and its outputs cleared before the request
    /// goes out. If the request cannot be sent the failure is appended to the
    /// cell as an error output.
    pub fn run_cell(
        &mut self,
        notebook: &mut Notebook,
        index: usize,
    ) -> Result<RunCell, DocumentError> {
        let cell = notebook.get_cell_mut(index)?;
        let key = cell.key();
        if !cell.is_code() {
            return Ok(RunCell::NotCode);
        }
        if self.running.contains_key(&key) {
            debug!("[execution] cell {} already running", index);
            return Ok(RunCell::AlreadyRunning);
        }

        if let Some(code) = cell.as_code_mut() {
            code.prompt = Prompt::Running;
            code.outputs.clear();
        }
        self.clear_pending.remove(&key);
        self.observer.prompt_changed(cell);
        self.observer.outputs_changed(cell);

        match self.session.run(&cell.source) {
            Ok(execution) => {
                info!("[execution] cell {} sent as {}", index, execution.msg_id());
                self.running.insert(key, execution.msg_id().to_string());
                execution.forward(key, self.events_tx.clone());
            }
            Err(e) => {
                self.apply_to_cell(cell, key, ExecutionEvent::Failed(e));
            }
        }
        Ok(RunCell::Started)
    }

    /// Apply every event that has already arrived. Never blocks.
    pub fn pump(&mut self, notebook: &mut Notebook) -> usize {
        let mut applied = 0;
        while let Ok((key, event)) = self.events_rx.try_recv() {
            self.apply(notebook, key, event);
            applied += 1;
        }
        applied
    }

    /// Apply events until no cell is running.
    ///
    /// Returns `false` if `timeout` passed first; the cells still running
    /// keep their requests and can be waited on again. Not for use inside an
    /// async context.
    pub fn wait(&mut self, notebook: &mut Notebook, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.pump(notebook);

        while !self.running.is_empty() {
            let next = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    let events_rx = &mut self.events_rx;
                    let next = self.session.block_on(async {
                        tokio::time::timeout(remaining, events_rx.recv()).await
                    });
                    match next {
                        Ok(next) => next,
                        Err(_) => return false,
                    }
                }
                None => self.events_rx.blocking_recv(),
            };
            match next {
                Some((key, event)) => self.apply(notebook, key, event),
                // Unreachable while we hold `events_tx`
                None => break,
            }
        }
        true
    }

    fn apply(&mut self, notebook: &mut Notebook, key: CellKey, event: ExecutionEvent) {
        match notebook.cell_by_key_mut(key) {
            Some(cell) => self.apply_to_cell(cell, key, event),
            None => {
                debug!("[execution] event for a deleted cell dropped");
                if event.is_terminal() {
                    self.running.remove(&key);
                    self.clear_pending.remove(&key);
                }
            }
        }
    }

    fn apply_to_cell(&mut self, cell: &mut Cell, key: CellKey, event: ExecutionEvent) {
        if event.is_terminal() {
            self.running.remove(&key);
            self.clear_pending.remove(&key);
        }
        let Some(code) = cell.as_code_mut() else {
            return;
        };

        match event {
            ExecutionEvent::Output(output) => {
                if self.clear_pending.remove(&key) {
                    code.outputs.clear();
                }
                code.outputs.push(output);
                self.observer.outputs_changed(cell);
            }
            ExecutionEvent::ClearOutput { wait: true } => {
                self.clear_pending.insert(key);
            }
            ExecutionEvent::ClearOutput { wait: false } => {
                code.outputs.clear();
                self.observer.outputs_changed(cell);
            }
            ExecutionEvent::Finished(outcome) => {
                code.prompt = match outcome.execution_count {
                    Some(count) => Prompt::Count(count),
                    None => Prompt::Unset,
                };
                self.observer.prompt_changed(cell);
                if let Some(text) = &outcome.pager {
                    self.observer.pager(text);
                }
                if let Some(text) = &outcome.next_input {
                    self.observer.next_input(cell, text);
                }
            }
            ExecutionEvent::Failed(err) => {
                code.outputs
                    .push(Output::error(err.kind_name(), &err.to_string(), Vec::new()));
                code.prompt = Prompt::Unset;
                self.observer.outputs_changed(cell);
                self.observer.prompt_changed(cell);
            }
        }
    }
}
