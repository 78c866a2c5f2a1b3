use cairn_types::content_id::{ContentId, IdParseError};
use cairn_types::manifest_id::ManifestId;
use cairn_types::object_id::ObjectId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("content not found: {0}")]
    ContentNotFound(ContentId),

    #[error("snapshot manifest not found: {0}")]
    SnapshotNotFound(ManifestId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("canceled")]
    Canceled,

    #[error("error reading directory: {0}")]
    DirectoryRead(#[source] Box<CairnError>),

    #[error("placeholder for '{0}' references an unknown object")]
    InvalidPlaceholder(String),

    #[error("unknown or unsupported entry type")]
    UnknownEntryType,

    #[error("action failed: {0}")]
    Action(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("found {count} unused contents ({bytes} bytes); not deleting because deletion was not requested")]
    WouldDelete { count: u32, bytes: i64 },

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// True when this error (or the error it wraps) is the cancellation
    /// sentinel. Cancellation is quiet termination, not a failure.
    pub fn is_canceled(&self) -> bool {
        match self {
            CairnError::Canceled => true,
            CairnError::DirectoryRead(inner) => inner.is_canceled(),
            _ => false,
        }
    }

    /// Strip wrapping that hides the underlying failure, so failed-entry
    /// records carry the root cause rather than layers of context.
    pub fn root_cause(&self) -> &CairnError {
        match self {
            CairnError::DirectoryRead(inner) => inner.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_is_detected_through_wrapping() {
        let err = CairnError::DirectoryRead(Box::new(CairnError::Canceled));
        assert!(err.is_canceled());
        assert!(!CairnError::Other("x".into()).is_canceled());
    }

    #[test]
    fn root_cause_unwraps_directory_read() {
        let io = CairnError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let wrapped = CairnError::DirectoryRead(Box::new(io));
        assert!(matches!(wrapped.root_cause(), CairnError::Io(_)));
    }
}
