//! Error classification
//!
//! Maps raw transport failures onto a small taxonomy that drives
//! retry-versus-fail-fast decisions in [`RetryPolicy`](super::retry::RetryPolicy)
//! and the [`ConnectionManager`](super::manager::ConnectionManager).

use std::io::ErrorKind;

use serde::{Deserialize, Serialize};

use super::error::RemoteError;

/// Failure category of a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Established connection dropped (reset, broken pipe, EOF)
    ConnectionLost,
    /// No answer in time
    Timeout,
    /// Credentials or permissions rejected
    AuthFailure,
    /// Remote path does not exist
    NotFound,
    /// Server actively refused the connection
    Refused,
    /// Host could not be resolved or routed to
    Unreachable,
    Unknown,
}

impl ErrorClass {
    /// Whether the error means the session itself is gone and a reconnect may help.
    pub fn is_connection_loss(self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Timeout)
    }
}

// Order matters: ENOTFOUND (DNS) must win over the generic "not found".
const UNREACHABLE: &[&str] = &[
    "enotfound",
    "getaddrinfo",
    "name or service not known",
    "failed to lookup address",
    "failed to resolve address",
    "no address found",
    "nodename nor servname",
    "ehostunreach",
    "enetunreach",
    "host unreachable",
    "network is unreachable",
    "no route to host",
];

const REFUSED: &[&str] = &["econnrefused", "connection refused"];

const TIMEOUT: &[&str] = &["etimedout", "timed out", "timeout", "deadline has elapsed"];

const CONNECTION_LOST: &[&str] = &[
    "econnreset",
    "connection reset",
    "broken pipe",
    "epipe",
    "econnaborted",
    "connection aborted",
    "connection closed",
    "connection lost",
    "closed connection",
    "not connected",
    "disconnected",
    "channel closed",
    "session closed",
    "unexpected eof",
    "end of file",
    "421 ",
];

const AUTH_FAILURE: &[&str] = &[
    "permission denied",
    "access denied",
    "authentication failed",
    "authentication rejected",
    "auth fail",
    "login incorrect",
    "login failed",
    "invalid credentials",
    "530 ",
];

const NOT_FOUND: &[&str] = &[
    "no such file",
    "enoent",
    "not found",
    "does not exist",
    "no such directory",
];

/// Classify a raw error message by its known transport signatures.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if any(UNREACHABLE) {
        ErrorClass::Unreachable
    } else if any(REFUSED) {
        ErrorClass::Refused
    } else if any(TIMEOUT) {
        ErrorClass::Timeout
    } else if any(CONNECTION_LOST) {
        ErrorClass::ConnectionLost
    } else if any(AUTH_FAILURE) {
        ErrorClass::AuthFailure
    } else if any(NOT_FOUND) {
        ErrorClass::NotFound
    } else {
        ErrorClass::Unknown
    }
}

/// Classify a typed error.
pub fn classify(error: &RemoteError) -> ErrorClass {
    match error {
        RemoteError::Authentication(_) | RemoteError::PermissionDenied(_) => {
            ErrorClass::AuthFailure
        }
        RemoteError::Timeout(_) => ErrorClass::Timeout,
        RemoteError::NotFound(_) => ErrorClass::NotFound,
        RemoteError::Connection(msg) => match classify_message(msg) {
            ErrorClass::Unknown | ErrorClass::NotFound | ErrorClass::AuthFailure => {
                ErrorClass::ConnectionLost
            }
            class => class,
        },
        RemoteError::Io(e) => classify_io(e),
        RemoteError::Protocol(msg) => classify_message(msg),
        RemoteError::OperationInProgress { .. }
        | RemoteError::ConnectInProgress
        | RemoteError::Conflict(_)
        | RemoteError::Unsupported(_)
        | RemoteError::NoConfiguration
        | RemoteError::InvalidConfig(_)
        | RemoteError::Credential(_)
        | RemoteError::KeyConversion(_) => ErrorClass::Unknown,
    }
}

fn classify_io(error: &std::io::Error) -> ErrorClass {
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => ErrorClass::ConnectionLost,
        ErrorKind::TimedOut => ErrorClass::Timeout,
        ErrorKind::ConnectionRefused => ErrorClass::Refused,
        ErrorKind::NotFound => ErrorClass::NotFound,
        ErrorKind::PermissionDenied => ErrorClass::AuthFailure,
        _ => classify_message(&error.to_string()),
    }
}
