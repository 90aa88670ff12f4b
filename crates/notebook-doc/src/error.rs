/// Error type for document operations and the persisted format.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("cell index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed notebook: {0}")]
    Malformed(String),

    #[error("unsupported nbformat version {0}")]
    UnsupportedVersion(u64),

    #[error("unknown cell type: {0}")]
    UnknownCellType(String),

    #[error("unknown output type: {0}")]
    UnknownOutputType(String),
}
