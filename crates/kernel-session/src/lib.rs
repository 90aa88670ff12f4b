//! Client for kernels hosted by a notebook server.
//!
//! Control operations (start, restart, interrupt, shutdown, documents) go
//! over HTTP; requests and replies travel as JSON frames on two WebSocket
//! channels per kernel, `shell` and `iopub`. A [`KernelSession`] correlates
//! replies with the request that caused them, and an
//! [`ExecutionController`] applies a cell's results to a
//! [`notebook_doc::Notebook`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use kernel_session::{ExecutionController, KernelSession, ServerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(KernelSession::new(ServerConfig::new("localhost:8888")?)?);
//! let mut notebook = session.open("Untitled.ipynb")?;
//! session.start()?;
//!
//! let mut controller = ExecutionController::new(session.clone(), ());
//! controller.run_cell(&mut notebook, 0)?;
//! controller.wait(&mut notebook, None);
//! session.save(&notebook)?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod error;
mod execution;
mod gateway;
mod pending;
mod reply;
mod server;
mod session;

pub use channel::{connect as connect_channel, handshake_payload, ChannelConnection, ChannelKind};
pub use config::{ServerConfig, ServerFlavor};
pub use error::SessionError;
pub use execution::{CellObserver, ExecutionController, RunCell};
pub use gateway::{GatewayFuture, KernelGateway};
pub use reply::{ExecuteOutcome, Execution, ExecutionEvent};
pub use server::{NotebookEntry, NotebookServer};
pub use session::{KernelSession, KernelStatus, SessionPhase};

pub use kernel_wire::ReplyStatus;
