//! In-memory gateway for driving a session without a server.
//!
//! The test thread plays the kernel: it reads requests from the shell end
//! and writes replies and iopub traffic back.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use kernel_session::{
    ChannelConnection, ChannelKind, GatewayFuture, KernelGateway, KernelSession, NotebookEntry,
    ServerConfig, SessionError,
};
use kernel_wire::{ExecutionState, Message, Status};
use serde_json::{json, Value};

#[derive(Default)]
struct FakeState {
    documents: HashMap<String, Value>,
    saved: Vec<(String, Value)>,
    calls: Vec<String>,
    fail_start: bool,
    fail_restart: bool,
    kernel_count: usize,
    /// Kernel-side ends of every channel the session opened, newest last.
    kernel_ends: Vec<ChannelConnection>,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_document(self: &Arc<Self>, id: &str, document: Value) {
        self.lock().documents.insert(id.to_string(), document);
    }

    pub fn fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn fail_restart(&self, fail: bool) {
        self.lock().fail_restart = fail;
    }

    /// Control calls seen so far, e.g. `start:nb-1` or `shutdown:kernel-1`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn saved(&self) -> Vec<(String, Value)> {
        self.lock().saved.clone()
    }

    /// The kernel side of the most recently opened shell and iopub channels.
    pub fn take_kernel(&self) -> FakeKernel {
        let mut state = self.lock();
        let mut shell = None;
        let mut iopub = None;
        for end in state.kernel_ends.drain(..) {
            match end.kind {
                ChannelKind::Shell => shell = Some(end),
                ChannelKind::Iopub => iopub = Some(end),
            }
        }
        FakeKernel {
            shell: shell.expect("session opened a shell channel"),
            iopub: iopub.expect("session opened an iopub channel"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

impl KernelGateway for FakeGateway {
    fn login(&self) -> GatewayFuture<'_, ()> {
        self.record("login".to_string());
        async { Ok(()) }.boxed()
    }

    fn list_notebooks(&self) -> GatewayFuture<'_, Vec<NotebookEntry>> {
        let mut entries: Vec<NotebookEntry> = self
            .lock()
            .documents
            .keys()
            .map(|id| NotebookEntry {
                id: id.clone(),
                name: id.clone(),
                kernel_id: None,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        async move { Ok(entries) }.boxed()
    }

    fn new_notebook(&self) -> GatewayFuture<'_, String> {
        let mut state = self.lock();
        let id = format!("Untitled{}.ipynb", state.documents.len());
        state.documents.insert(
            id.clone(),
            json!({"nbformat": 4, "nbformat_minor": 4, "metadata": {}, "cells": []}),
        );
        async move { Ok(id) }.boxed()
    }

    fn fetch_notebook<'a>(&'a self, notebook_id: &'a str) -> GatewayFuture<'a, Value> {
        let document = self.lock().documents.get(notebook_id).cloned();
        async move {
            document.ok_or(SessionError::HttpStatus {
                method: reqwest::Method::GET,
                path: notebook_id.to_string(),
                status: 404,
            })
        }
        .boxed()
    }

    fn save_notebook<'a>(
        &'a self,
        notebook_id: &'a str,
        document: Value,
    ) -> GatewayFuture<'a, ()> {
        let mut state = self.lock();
        state
            .documents
            .insert(notebook_id.to_string(), document.clone());
        state.saved.push((notebook_id.to_string(), document));
        async { Ok(()) }.boxed()
    }

    fn start_kernel<'a>(&'a self, notebook_id: &'a str) -> GatewayFuture<'a, String> {
        let mut state = self.lock();
        state.calls.push(format!("start:{}", notebook_id));
        let result = if state.fail_start {
            Err(SessionError::KernelUnreachable("connection refused".to_string()))
        } else {
            state.kernel_count += 1;
            Ok(format!("kernel-{}", state.kernel_count))
        };
        async move { result }.boxed()
    }

    fn restart_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()> {
        let mut state = self.lock();
        state.calls.push(format!("restart:{}", kernel_id));
        let result = if state.fail_restart {
            Err(SessionError::HttpStatus {
                method: reqwest::Method::POST,
                path: format!("/kernels/{}/restart", kernel_id),
                status: 500,
            })
        } else {
            Ok(())
        };
        async move { result }.boxed()
    }

    fn interrupt_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()> {
        self.record(format!("interrupt:{}", kernel_id));
        async { Ok(()) }.boxed()
    }

    fn shutdown_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()> {
        self.record(format!("shutdown:{}", kernel_id));
        async { Ok(()) }.boxed()
    }

    fn open_channel<'a>(
        &'a self,
        _kernel_id: &'a str,
        kind: ChannelKind,
        _session_id: &'a str,
    ) -> GatewayFuture<'a, ChannelConnection> {
        let (session_end, kernel_end) = ChannelConnection::pair(kind);
        self.lock().kernel_ends.push(kernel_end);
        async move { Ok(session_end) }.boxed()
    }
}

/// The kernel's side of one shell/iopub pair.
pub struct FakeKernel {
    shell: ChannelConnection,
    iopub: ChannelConnection,
}

impl FakeKernel {
    /// Next request the session sent on shell; panics after five seconds.
    pub fn next_request(&mut self) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.shell.inbound.try_recv() {
                Ok(frame) => return kernel_wire::decode(&frame).expect("session sent a valid frame"),
                Err(tokio::sync::mpsc::error::TryRecvError::Empty) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("no request from session: {:?}", e),
            }
        }
    }

    pub fn reply(&self, parent: &Message, msg_type: &str, content: Value) {
        let message = reply_message(parent, msg_type, content);
        self.shell
            .outbound
            .send(kernel_wire::encode(&message).unwrap())
            .unwrap();
    }

    pub fn publish(&self, parent: &Message, msg_type: &str, content: Value) {
        let message = reply_message(parent, msg_type, content);
        self.iopub
            .outbound
            .send(kernel_wire::encode(&message).unwrap())
            .unwrap();
    }

    pub fn publish_status(&self, state: ExecutionState) {
        let message = Message::new(
            Status {
                execution_state: state,
            },
            "kernel",
            "kernel",
        );
        self.iopub
            .outbound
            .send(kernel_wire::encode(&message).unwrap())
            .unwrap();
    }

    /// Push a frame exactly as given.
    pub fn send_raw(&self, kind: ChannelKind, frame: &str) {
        let end = match kind {
            ChannelKind::Shell => &self.shell,
            ChannelKind::Iopub => &self.iopub,
        };
        end.outbound.send(frame.to_string()).unwrap();
    }

    /// Drop the iopub socket from the kernel side.
    pub fn close_iopub(self) -> ChannelConnection {
        drop(self.iopub);
        self.shell
    }

    /// True once the session has closed its shell sender.
    pub fn shell_closed(&mut self) -> bool {
        matches!(
            self.shell.inbound.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        )
    }
}

fn reply_message(parent: &Message, msg_type: &str, content: Value) -> Message {
    let content = kernel_wire::parse_content(msg_type, content).unwrap();
    Message::reply_to(parent, content)
}

pub fn config() -> ServerConfig {
    ServerConfig::new("localhost:8888")
        .unwrap()
        .with_complete_timeout(Duration::from_millis(100))
}

pub fn sample_document() -> Value {
    json!({
        "nbformat": 4,
        "nbformat_minor": 4,
        "metadata": {},
        "cells": [
            {"cell_type": "code", "execution_count": null, "metadata": {}, "outputs": [], "source": "print('a')"},
            {"cell_type": "markdown", "metadata": {}, "source": "# Notes"},
            {"cell_type": "code", "execution_count": null, "metadata": {}, "outputs": [], "source": "1 + 1"}
        ]
    })
}

/// A connected session over a fresh fake gateway.
pub fn connected_session() -> (Arc<FakeGateway>, KernelSession, FakeKernel) {
    let _ = env_logger::builder().is_test(true).try_init();
    let gateway = FakeGateway::new();
    gateway.with_document("nb-1", sample_document());
    let session = KernelSession::with_gateway(gateway.clone(), &config()).unwrap();
    session.open("nb-1").unwrap();
    session.start().unwrap();
    let kernel = gateway.take_kernel();
    (gateway, session, kernel)
}

/// Poll `cond` for up to two seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
