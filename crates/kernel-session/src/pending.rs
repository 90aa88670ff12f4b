//! Outstanding requests, keyed by the request's `msg_id`.

use std::collections::HashMap;

use kernel_wire::{CompleteReply, JupyterMessageContent};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::SessionError;
use crate::reply::{ExecuteOutcome, ExecutionEvent};

/// Where replies to one request are delivered.
#[derive(Debug)]
pub(crate) enum ReplySink {
    /// Every output until `execute_reply`.
    Execute(mpsc::UnboundedSender<ExecutionEvent>),
    /// The single `complete_reply`.
    Complete(oneshot::Sender<Result<CompleteReply, SessionError>>),
}

/// What happened to an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Delivered to a live request.
    Delivered,
    /// Delivered as the terminal reply; the entry is gone.
    Retired,
    /// No request with that id; dropped.
    Unmatched,
    /// Request exists but the message is not something it consumes.
    Ignored,
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<String, ReplySink>,
}

impl PendingTable {
    pub fn insert(&mut self, msg_id: String, sink: ReplySink) {
        self.entries.insert(msg_id, sink);
    }

    pub fn remove(&mut self, msg_id: &str) -> Option<ReplySink> {
        self.entries.remove(msg_id)
    }

    pub fn contains(&self, msg_id: &str) -> bool {
        self.entries.contains_key(msg_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Deliver `content` to the request whose id is `parent_id`.
    pub fn route(&mut self, parent_id: &str, content: JupyterMessageContent) -> Routed {
        let is_execute = match self.entries.get(parent_id) {
            Some(sink) => matches!(sink, ReplySink::Execute(_)),
            None => return Routed::Unmatched,
        };

        match content {
            JupyterMessageContent::ExecuteReply(reply) if is_execute => {
                if let Some(ReplySink::Execute(tx)) = self.entries.remove(parent_id) {
                    let _ = tx.send(ExecutionEvent::Finished(ExecuteOutcome::from(reply)));
                }
                Routed::Retired
            }
            JupyterMessageContent::CompleteReply(reply) if !is_execute => {
                if let Some(ReplySink::Complete(tx)) = self.entries.remove(parent_id) {
                    let _ = tx.send(Ok(reply));
                }
                Routed::Retired
            }
            JupyterMessageContent::ClearOutput(clear) if is_execute => {
                self.send_event(parent_id, ExecutionEvent::ClearOutput { wait: clear.wait })
            }
            content if is_execute && kernel_wire::is_output(&content) => {
                match kernel_wire::into_output(content) {
                    Ok(output) => self.send_event(parent_id, ExecutionEvent::Output(output)),
                    Err(e) => {
                        warn!("[pending] dropping output for {}: {}", parent_id, e);
                        Routed::Ignored
                    }
                }
            }
            content => {
                debug!(
                    "[pending] {} not consumed by request {}",
                    content.message_type(),
                    parent_id
                );
                Routed::Ignored
            }
        }
    }

    fn send_event(&self, parent_id: &str, event: ExecutionEvent) -> Routed {
        if let Some(ReplySink::Execute(tx)) = self.entries.get(parent_id) {
            // A dropped receiver still gets its entry retired by execute_reply
            let _ = tx.send(event);
        }
        Routed::Delivered
    }

    /// Fail and drop every outstanding request. Returns how many there were.
    pub fn fail_all(&mut self, reason: impl Fn() -> SessionError) -> usize {
        let count = self.entries.len();
        for (_, sink) in self.entries.drain() {
            match sink {
                ReplySink::Execute(tx) => {
                    let _ = tx.send(ExecutionEvent::Failed(reason()));
                }
                ReplySink::Complete(tx) => {
                    let _ = tx.send(Err(reason()));
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_wire::{ClearOutput, Status, StreamContent};
    use notebook_doc::Output;
    use serde_json::json;

    fn execute_reply(count: i64) -> JupyterMessageContent {
        kernel_wire::parse_content(
            "execute_reply",
            json!({"status": "ok", "execution_count": count}),
        )
        .unwrap()
    }

    #[test]
    fn test_unmatched_parent_is_dropped() {
        let mut table = PendingTable::default();
        let routed = table.route("nobody", StreamContent::stdout("x").into());
        assert_eq!(routed, Routed::Unmatched);
    }

    #[test]
    fn test_execute_outputs_then_reply_retires() {
        let mut table = PendingTable::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.insert("req-1".to_string(), ReplySink::Execute(tx));

        let stream = StreamContent::stdout("hi\n");
        assert_eq!(table.route("req-1", stream.into()), Routed::Delivered);
        assert_eq!(
            table.route("req-1", ClearOutput { wait: true }.into()),
            Routed::Delivered
        );
        assert_eq!(table.route("req-1", execute_reply(4)), Routed::Retired);
        assert!(!table.contains("req-1"));

        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::Output(Output::Stream { ref text, .. }) if text == "hi\n"
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::ClearOutput { wait: true }
        ));
        match rx.try_recv().unwrap() {
            ExecutionEvent::Finished(outcome) => assert_eq!(outcome.execution_count, Some(4)),
            other => panic!("expected Finished, got {:?}", other),
        }
        // Sender dropped with the entry
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_status_and_mismatched_reply_are_ignored() {
        let mut table = PendingTable::default();
        let (tx, _rx) = oneshot::channel();
        table.insert("c-1".to_string(), ReplySink::Complete(tx));

        assert_eq!(table.route("c-1", Status::busy().into()), Routed::Ignored);
        assert_eq!(
            table.route("c-1", execute_reply(1)),
            Routed::Ignored
        );
        assert!(table.contains("c-1"));
    }

    #[test]
    fn test_complete_reply_resolves_oneshot() {
        let mut table = PendingTable::default();
        let (tx, mut rx) = oneshot::channel();
        table.insert("c-2".to_string(), ReplySink::Complete(tx));

        let reply = kernel_wire::parse_content(
            "complete_reply",
            json!({"matches": ["print", "property"], "status": "ok"}),
        )
        .unwrap();
        assert_eq!(table.route("c-2", reply), Routed::Retired);
        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.matches, vec!["print", "property"]);
    }

    #[test]
    fn test_fail_all_notifies_every_request() {
        let mut table = PendingTable::default();
        let (exec_tx, mut exec_rx) = mpsc::unbounded_channel();
        let (comp_tx, mut comp_rx) = oneshot::channel();
        table.insert("e".to_string(), ReplySink::Execute(exec_tx));
        table.insert("c".to_string(), ReplySink::Complete(comp_tx));

        assert_eq!(table.fail_all(|| SessionError::SessionInvalidated), 2);
        assert_eq!(table.len(), 0);
        assert!(matches!(
            exec_rx.try_recv().unwrap(),
            ExecutionEvent::Failed(SessionError::SessionInvalidated)
        ));
        assert!(matches!(
            comp_rx.try_recv().unwrap(),
            Err(SessionError::SessionInvalidated)
        ));
    }
}
