//! What callers receive for an execute request.

use std::time::Duration;

use kernel_wire::{ExecuteReply, ReplyStatus};
use log::debug;
use notebook_doc::Output;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::SessionError;

/// Terminal summary of an execute request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOutcome {
    pub status: ReplyStatus,
    pub execution_count: Option<i64>,
    /// Text the kernel asked to show in a pager (`?` help, `%magic?`).
    pub pager: Option<String>,
    /// Replacement text the kernel proposed for the next cell.
    pub next_input: Option<String>,
}

impl From<ExecuteReply> for ExecuteOutcome {
    fn from(reply: ExecuteReply) -> Self {
        Self {
            pager: kernel_wire::pager_text(&reply),
            next_input: kernel_wire::next_input(&reply),
            // A counter of 0 stands for one the kernel did not send.
            execution_count: match reply.execution_count.0 {
                0 => None,
                n => i64::try_from(n).ok(),
            },
            status: reply.status,
        }
    }
}

/// One step of an execution, in arrival order.
///
/// `Finished` and `Failed` are terminal: the stream ends after either.
#[derive(Debug)]
pub enum ExecutionEvent {
    Output(Output),
    /// Drop the outputs shown so far; with `wait`, only once the next one arrives.
    ClearOutput { wait: bool },
    Finished(ExecuteOutcome),
    Failed(SessionError),
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Finished(_) | ExecutionEvent::Failed(_)
        )
    }
}

/// Handle to a submitted execute request.
#[derive(Debug)]
pub struct Execution {
    msg_id: String,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
    handle: Handle,
}

impl Execution {
    pub(crate) fn new(
        msg_id: String,
        events: mpsc::UnboundedReceiver<ExecutionEvent>,
        handle: Handle,
    ) -> Self {
        Self {
            msg_id,
            events,
            handle,
        }
    }

    /// Message id of the request; replies carry it as their parent id.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// The next event if one is already queued.
    pub fn try_next(&mut self) -> Option<ExecutionEvent> {
        self.events.try_recv().ok()
    }

    /// Block until the next event. Not for use inside an async context.
    pub fn next_blocking(&mut self) -> Option<ExecutionEvent> {
        self.events.blocking_recv()
    }

    /// Block for at most `timeout`. Not for use inside an async context.
    pub fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ExecutionEvent>, SessionError> {
        let events = &mut self.events;
        self.handle
            .block_on(async { tokio::time::timeout(timeout, events.recv()).await })
            .map_err(|_| SessionError::RequestTimeout)
    }

    /// Block until the terminal event, collecting outputs along the way.
    ///
    /// `ClearOutput` is applied to the collected list.
    pub fn wait(mut self) -> (Vec<Output>, Result<ExecuteOutcome, SessionError>) {
        let mut outputs = Vec::new();
        let mut clear_pending = false;
        while let Some(event) = self.next_blocking() {
            match event {
                ExecutionEvent::Output(output) => {
                    if clear_pending {
                        outputs.clear();
                        clear_pending = false;
                    }
                    outputs.push(output);
                }
                ExecutionEvent::ClearOutput { wait: true } => clear_pending = true,
                ExecutionEvent::ClearOutput { wait: false } => outputs.clear(),
                ExecutionEvent::Finished(outcome) => return (outputs, Ok(outcome)),
                ExecutionEvent::Failed(err) => return (outputs, Err(err)),
            }
        }
        (
            outputs,
            Err(SessionError::Disconnected(
                "event stream ended before the reply".to_string(),
            )),
        )
    }

    /// Forward every event, tagged, into a shared queue.
    ///
    /// Runs on the session runtime until the stream ends or `tx` is closed.
    pub fn forward<T>(self, tag: T, tx: mpsc::UnboundedSender<(T, ExecutionEvent)>)
    where
        T: Clone + Send + 'static,
    {
        let Execution {
            msg_id,
            mut events,
            handle,
        } = self;
        handle.spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((tag.clone(), event)).is_err() {
                    debug!("[execution] {} forward target dropped", msg_id);
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_wire::JupyterMessageContent;
    use serde_json::{json, Value};

    fn outcome(content: Value) -> ExecuteOutcome {
        match kernel_wire::parse_content("execute_reply", content).unwrap() {
            JupyterMessageContent::ExecuteReply(reply) => ExecuteOutcome::from(reply),
            other => panic!("expected execute_reply, got {:?}", other),
        }
    }

    #[test]
    fn test_aborted_reply_has_no_counter() {
        let aborted = outcome(json!({"status": "aborted", "execution_count": null}));
        assert_eq!(aborted.status, ReplyStatus::Aborted);
        assert_eq!(aborted.execution_count, None);
    }

    #[test]
    fn test_outcome_carries_pager_and_next_input() {
        let done = outcome(json!({
            "status": "ok",
            "prompt_number": 7,
            "payload": [
                {"source": "IPython.kernel.zmq.page.page", "text": "Signature: f()"},
                {"source": "set_next_input", "text": "f(1)"}
            ]
        }));
        assert_eq!(done.execution_count, Some(7));
        assert_eq!(done.pager.as_deref(), Some("Signature: f()"));
        assert_eq!(done.next_input.as_deref(), Some("f(1)"));
    }
}
