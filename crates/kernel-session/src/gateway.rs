//! The seam between a session and the server it talks to.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::channel::{ChannelConnection, ChannelKind};
use crate::error::SessionError;
use crate::server::{NotebookEntry, NotebookServer};

pub type GatewayFuture<'a, T> = BoxFuture<'a, Result<T, SessionError>>;

/// Everything a [`KernelSession`](crate::KernelSession) needs from a server.
///
/// [`NotebookServer`] implements it over HTTP and WebSockets; tests drive a
/// session through an in-memory implementation.
pub trait KernelGateway: Send + Sync + 'static {
    fn login(&self) -> GatewayFuture<'_, ()>;

    fn list_notebooks(&self) -> GatewayFuture<'_, Vec<NotebookEntry>>;

    fn new_notebook(&self) -> GatewayFuture<'_, String>;

    /// The document as JSON, unwrapped from any server model.
    fn fetch_notebook<'a>(&'a self, notebook_id: &'a str) -> GatewayFuture<'a, Value>;

    fn save_notebook<'a>(&'a self, notebook_id: &'a str, document: Value)
        -> GatewayFuture<'a, ()>;

    /// Start the notebook's kernel, returning its id.
    fn start_kernel<'a>(&'a self, notebook_id: &'a str) -> GatewayFuture<'a, String>;

    fn restart_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()>;

    fn interrupt_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()>;

    fn shutdown_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()>;

    /// Open one kernel channel. The handshake is sent before this resolves.
    fn open_channel<'a>(
        &'a self,
        kernel_id: &'a str,
        kind: ChannelKind,
        session_id: &'a str,
    ) -> GatewayFuture<'a, ChannelConnection>;
}

impl KernelGateway for NotebookServer {
    fn login(&self) -> GatewayFuture<'_, ()> {
        NotebookServer::login(self).boxed()
    }

    fn list_notebooks(&self) -> GatewayFuture<'_, Vec<NotebookEntry>> {
        NotebookServer::list_notebooks(self).boxed()
    }

    fn new_notebook(&self) -> GatewayFuture<'_, String> {
        NotebookServer::new_notebook(self).boxed()
    }

    fn fetch_notebook<'a>(&'a self, notebook_id: &'a str) -> GatewayFuture<'a, Value> {
        NotebookServer::fetch_notebook(self, notebook_id).boxed()
    }

    fn save_notebook<'a>(
        &'a self,
        notebook_id: &'a str,
        document: Value,
    ) -> GatewayFuture<'a, ()> {
        NotebookServer::save_notebook(self, notebook_id, document).boxed()
    }

    fn start_kernel<'a>(&'a self, notebook_id: &'a str) -> GatewayFuture<'a, String> {
        NotebookServer::start_kernel(self, notebook_id).boxed()
    }

    fn restart_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()> {
        NotebookServer::restart_kernel(self, kernel_id).boxed()
    }

    fn interrupt_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()> {
        NotebookServer::interrupt_kernel(self, kernel_id).boxed()
    }

    fn shutdown_kernel<'a>(&'a self, kernel_id: &'a str) -> GatewayFuture<'a, ()> {
        NotebookServer::shutdown_kernel(self, kernel_id).boxed()
    }

    fn open_channel<'a>(
        &'a self,
        kernel_id: &'a str,
        kind: ChannelKind,
        session_id: &'a str,
    ) -> GatewayFuture<'a, ChannelConnection> {
        NotebookServer::open_channel(self, kernel_id, kind, session_id).boxed()
    }
}
