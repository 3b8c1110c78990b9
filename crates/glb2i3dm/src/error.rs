use i3dm::I3dmError;
use std::path::Path;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GenerateError>;

#[derive(Error, Debug)]
pub enum GenerateError {
    /// Rejected before any file is touched.
    #[error("{0}")]
    InvalidInput(String),

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("encoding failed: {0}")]
    Encode(I3dmError),
}

impl GenerateError {
    #[cold]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    #[cold]
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    /// Wraps an IO error with the operation and path it happened on.
    pub fn io(op: &str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let context = format!("{op} {}", path.display());
        move |source| Self::Io { context, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::Io { .. } | Self::Catalog(_) => "io_failure",
            Self::Encode(_) => "encode_failure",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::NotFound { .. } => 3,
            _ => 1,
        }
    }
}

impl From<I3dmError> for GenerateError {
    fn from(e: I3dmError) -> Self {
        match e {
            I3dmError::InvalidInput(msg) => Self::InvalidInput(msg),
            I3dmError::Io(source) => Self::Io {
                context: "tile IO".to_owned(),
                source,
            },
            other => Self::Encode(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_input_errors_keep_their_kind() {
        let e: GenerateError = I3dmError::InvalidInput("need at least one instance".into()).into();
        assert_eq!(e.kind(), "invalid_input");
        assert_eq!(e.exit_code(), 2);
        assert_eq!(e.to_string(), "need at least one instance");

        let e: GenerateError = I3dmError::Truncated.into();
        assert_eq!(e.kind(), "encode_failure");
        assert_eq!(e.exit_code(), 1);
    }

    #[test]
    fn io_errors_carry_context() {
        let path = Path::new("/nope/tile.i3dm");
        let e = GenerateError::io("writing", path)(std::io::Error::from(std::io::ErrorKind::PermissionDenied));

        assert_eq!(e.kind(), "io_failure");
        assert!(e.to_string().starts_with("writing /nope/tile.i3dm: "));
    }
}
