use kernel_wire::WireError;
use notebook_doc::DocumentError;

use crate::session::SessionPhase;

/// Errors surfaced by the session client.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    /// Network failure or an unusable reply from a control endpoint.
    #[error("Kernel unreachable: {0}")]
    KernelUnreachable(String),

    #[error("Server returned {status} for {method} {path}")]
    HttpStatus {
        method: reqwest::Method,
        path: String,
        status: u16,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The kernel was restarted while the request was outstanding.
    #[error("Session invalidated by kernel restart")]
    SessionInvalidated,

    /// The session was shut down while the request was outstanding.
    #[error("Session closed")]
    SessionClosed,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Channel disconnected: {0}")]
    Disconnected(String),

    #[error("Cannot {operation} while the session is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: SessionPhase,
    },

    #[error("No notebook is open in this session")]
    NoNotebook,

    #[error(transparent)]
    Wire(WireError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl SessionError {
    /// Short name used as `ename` when the failure is shown in a cell.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SessionError::InvalidAddress(_) => "InvalidAddress",
            SessionError::KernelUnreachable(_) | SessionError::HttpStatus { .. } => {
                "KernelUnreachable"
            }
            SessionError::MalformedMessage(_) => "MalformedMessage",
            SessionError::SessionInvalidated => "SessionInvalidated",
            SessionError::SessionClosed => "SessionClosed",
            SessionError::RequestTimeout => "RequestTimeout",
            SessionError::Disconnected(_) => "Disconnected",
            SessionError::InvalidPhase { .. } => "InvalidPhase",
            SessionError::NoNotebook => "NoNotebook",
            SessionError::Wire(_) => "WireError",
            SessionError::Document(_) => "DocumentError",
            SessionError::Runtime(_) => "RuntimeError",
        }
    }

    /// True for network-level failures of the HTTP control plane.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            SessionError::KernelUnreachable(_) | SessionError::HttpStatus { .. }
        )
    }
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::MalformedMessage(message) => SessionError::MalformedMessage(message),
            other => SessionError::Wire(other),
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::KernelUnreachable(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::KernelUnreachable(format!("websocket: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undecodable_frame_is_malformed_message() {
        let err = SessionError::from(kernel_wire::decode("hallo").unwrap_err());
        assert!(matches!(err, SessionError::MalformedMessage(_)));
        assert_eq!(err.kind_name(), "MalformedMessage");
    }

    #[test]
    fn test_unknown_output_kind_stays_a_wire_error() {
        let err = SessionError::from(
            kernel_wire::normalize_output("custom_event", serde_json::json!({})).unwrap_err(),
        );
        assert!(matches!(err, SessionError::Wire(WireError::UnknownMessageType(_))));
        assert_eq!(err.kind_name(), "WireError");
    }
}
