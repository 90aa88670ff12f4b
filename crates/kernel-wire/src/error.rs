/// Error type for message encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
