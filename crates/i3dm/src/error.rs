use thiserror::Error;

pub type Result<T> = std::result::Result<T, I3dmError>;

#[derive(Error, Debug)]
pub enum I3dmError {
    /// Caller supplied something we refuse to encode (empty list, bad coordinate, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A tile being decoded is structurally wrong.
    #[error("invalid i3dm: {0}")]
    InvalidData(String),

    #[error("truncated i3dm")]
    Truncated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl I3dmError {
    #[cold]
    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    #[cold]
    pub(crate) fn bad(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }
}
