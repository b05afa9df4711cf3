use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// How a failure should be treated by the retry layer and by batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientRemote,
    FatalRemote,
    FatalLocal,
    Consistency,
    Unclassified,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientRemote | ErrorClass::Unclassified)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited by remote service")]
    RateLimited,
    #[error("remote server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("remote rejected request: {0}")]
    Validation(String),
    #[error("{0} not found on remote")]
    RemoteNotFound(String),
    #[error("no local file for {0}")]
    MissingFile(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{id}: {reason}")]
    Consistency { id: String, reason: String },
    #[error("malformed file {}: {reason}", path.display())]
    MalformedFile { path: PathBuf, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn consistency(id: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Consistency {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Map an HTTP status (and response text) to the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => SyncError::Auth(message),
            404 => SyncError::RemoteNotFound(message),
            408 => SyncError::Timeout(message),
            429 => SyncError::RateLimited,
            500..=599 => SyncError::Server { status, message },
            _ => SyncError::Validation(message),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Network(_)
            | SyncError::Timeout(_)
            | SyncError::RateLimited
            | SyncError::Server { .. } => ErrorClass::TransientRemote,
            SyncError::Auth(_) | SyncError::Validation(_) | SyncError::RemoteNotFound(_) => {
                ErrorClass::FatalRemote
            }
            SyncError::MissingFile(_) => ErrorClass::FatalLocal,
            SyncError::Io { source, .. } => match source.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorClass::FatalLocal,
                _ => ErrorClass::Unclassified,
            },
            SyncError::Consistency { .. } | SyncError::MalformedFile { .. } => {
                ErrorClass::Consistency
            }
            SyncError::Other(_) => ErrorClass::Unclassified,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            SyncError::Validation(format!("unexpected response body: {err}"))
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(SyncError::from_status(401, "").class(), ErrorClass::FatalRemote);
        assert_eq!(SyncError::from_status(400, "").class(), ErrorClass::FatalRemote);
        assert_eq!(SyncError::from_status(429, "").class(), ErrorClass::TransientRemote);
        assert_eq!(SyncError::from_status(503, "").class(), ErrorClass::TransientRemote);
    }

    #[test]
    fn io_errors_split_by_kind() {
        let missing = SyncError::io("read", io::Error::from(io::ErrorKind::NotFound));
        assert!(!missing.is_retryable());
        let denied = SyncError::io("write", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.class(), ErrorClass::FatalLocal);
        let other = SyncError::io("write", io::Error::from(io::ErrorKind::Interrupted));
        assert!(other.is_retryable());
    }

    #[test]
    fn unclassified_errors_are_retried() {
        let err = SyncError::from(anyhow::anyhow!("something odd"));
        assert_eq!(err.class(), ErrorClass::Unclassified);
        assert!(err.is_retryable());
    }

    #[test]
    fn consistency_errors_are_not_retried() {
        let err = SyncError::consistency("ENG-1", "unknown status");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "ENG-1: unknown status");
    }
}
