//! Kernel message codec.
//!
//! This crate turns the JSON frames exchanged with a notebook server's kernel
//! channels into [`Message`]s carrying typed [`JupyterMessageContent`] and
//! back, and normalizes the heterogeneous rich-output payloads into
//! [`notebook_doc::Output`] records.
//!
//! # Features
//!
//! - [`Message`] envelope over `jupyter_protocol`'s [`Header`] and content types
//! - Intermediate [`RawMessage`] for incoming frames, converted by `msg_type`
//! - Older IPython names (`pyout`, `pyerr`, `pyin`, stream `data`,
//!   `prompt_number`, dotted payload sources) upgraded before parsing
//! - [`normalize_output`] for `stream`, `display_data`, `execute_result`, `error`

mod error;
mod legacy;
mod message;
mod output;

pub use error::WireError;
pub use message::{decode, encode, parse_content, Message, RawMessage};
pub use output::{into_output, is_output, next_input, normalize_output, pager_text};

pub use jupyter_protocol::{
    ClearOutput, CompleteReply, CompleteRequest, DisplayData, ErrorOutput, ExecuteReply,
    ExecuteRequest, ExecuteResult, ExecutionCount, ExecutionState, Header, JupyterMessage,
    JupyterMessageContent, Media, MediaType, Payload, ReplyStatus, Status, Stdio, StreamContent,
};
