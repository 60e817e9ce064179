//! Remote operation error types
//!
//! Every failure that leaves the connection layer is one of these variants.
//! Raw transport text is routed through [`classify`](super::classify) so the
//! manager can decide between retry, reconnect and fail-fast.

use thiserror::Error;

use super::classify::{classify_message, ErrorClass};
use super::lock::Verb;
use crate::config::ConfigError;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A {verb} operation is already in progress for {path}; wait for it to finish and try again")]
    OperationInProgress { verb: Verb, path: String },

    #[error("A connection attempt is already in progress; wait for it to finish")]
    ConnectInProgress,

    #[error("Target already exists: {0}. Confirm overwrite to replace it")]
    Conflict(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No configuration available; connect with a connection config first")]
    NoConfiguration,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Credential store error: {0}")]
    Credential(#[from] crate::config::CredentialError),

    #[error("Private key error: {0}")]
    KeyConversion(#[from] crate::sftp::KeyConversionError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Build a typed error from raw transport text.
    ///
    /// Used wherever a library only hands us a message string.
    pub fn from_transport(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_message(&message) {
            ErrorClass::ConnectionLost | ErrorClass::Refused | ErrorClass::Unreachable => {
                Self::Connection(message)
            }
            ErrorClass::Timeout => Self::Timeout(message),
            ErrorClass::NotFound => Self::NotFound(message),
            ErrorClass::AuthFailure => {
                let lower = message.to_lowercase();
                if lower.contains("permission denied (") || lower.contains("authentication") {
                    Self::Authentication(message)
                } else if lower.contains("permission denied") || lower.contains("access denied") {
                    Self::PermissionDenied(message)
                } else {
                    Self::Authentication(message)
                }
            }
            ErrorClass::Unknown => Self::Protocol(message),
        }
    }

    /// Attach a path to a `NotFound`/`PermissionDenied` produced from raw text.
    pub fn at_path(self, path: &str) -> Self {
        match self {
            Self::NotFound(_) => Self::NotFound(path.to_string()),
            Self::PermissionDenied(_) => Self::PermissionDenied(path.to_string()),
            other => other,
        }
    }
}

impl From<russh::Error> for RemoteError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => Self::Io(e),
            other => Self::from_transport(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for RemoteError {
    fn from(err: russh::keys::Error) -> Self {
        Self::KeyConversion(crate::sftp::KeyConversionError::CorruptFormat(err.to_string()))
    }
}

impl From<russh_sftp::client::error::Error> for RemoteError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        Self::from_transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RemoteError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout("operation did not complete in time".to_string())
    }
}

// Serializable so a UI bridge can forward errors verbatim
impl serde::Serialize for RemoteError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_maps_to_taxonomy() {
        assert!(matches!(
            RemoteError::from_transport("read ECONNRESET"),
            RemoteError::Connection(_)
        ));
        assert!(matches!(
            RemoteError::from_transport("connect ETIMEDOUT 10.0.0.1:22"),
            RemoteError::Timeout(_)
        ));
        assert!(matches!(
            RemoteError::from_transport("No such file"),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            RemoteError::from_transport("Permission denied"),
            RemoteError::PermissionDenied(_)
        ));
        assert!(matches!(
            RemoteError::from_transport("Permission denied (publickey,password)."),
            RemoteError::Authentication(_)
        ));
        assert!(matches!(
            RemoteError::from_transport("weird server reply"),
            RemoteError::Protocol(_)
        ));
    }

    #[test]
    fn test_at_path_rewrites_message() {
        let err = RemoteError::from_transport("No such file").at_path("/srv/a.txt");
        assert_eq!(err.to_string(), "Not found: /srv/a.txt");
    }

    #[test]
    fn test_in_progress_message_is_actionable() {
        let err = RemoteError::OperationInProgress {
            verb: Verb::Write,
            path: "/a.txt".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("write"));
        assert!(msg.contains("/a.txt"));
        assert!(msg.contains("wait"));
    }
}
