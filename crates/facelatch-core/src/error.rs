use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy shared by training, persistence and the decision engine.
///
/// Only [`AuthError::Extraction`] is recoverable: the decision loop absorbs it
/// and samples another frame. Everything else ends a session or a training run.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("model format error: {0}")]
    Format(String),
    #[error("no usable descriptor: {0}")]
    Extraction(String),
    #[error("resource unavailable: {0}")]
    Resource(String),
    #[error("insufficient training data: {0}")]
    InsufficientData(String),
    #[error("invalid training sample #{index}: {reason}")]
    InvalidSample { index: usize, reason: String },
    #[error("model already exists at {} (use force to overwrite)", .0.display())]
    ModelExists(PathBuf),
    #[error("no model enrolled at {}", .0.display())]
    ModelMissing(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AuthError {
    /// Whether the decision loop may retry after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AuthError::Extraction(_))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AuthError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_extraction_is_recoverable() {
        assert!(AuthError::Extraction("no face".into()).is_recoverable());
        assert!(!AuthError::Resource("camera gone".into()).is_recoverable());
        assert!(!AuthError::Format("bad tag".into()).is_recoverable());
        assert!(!AuthError::Config("bad threshold".into()).is_recoverable());
        assert!(!AuthError::InsufficientData("empty".into()).is_recoverable());
    }

    #[test]
    fn model_exists_message_names_path() {
        let err = AuthError::ModelExists(PathBuf::from("/tmp/alice.model.json"));
        assert!(err.to_string().contains("/tmp/alice.model.json"));
    }
}
