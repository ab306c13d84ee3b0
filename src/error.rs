//! Error handling primitives shared by the dispatch frontend and all drivers.

use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Convenient result alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
/// Stable classification of an operation failure, independent of the backend
/// that produced it.
pub enum ErrorKind {
    NotFound,
    Conflict,
    CapacityExceeded,
    PolicyDenied,
    BackendUnavailable,
    Unsupported,
    IoError,
    Timeout,
    Cancelled,
    InvalidArgument,
    Internal,
}

#[derive(Debug, Error)]
#[error("{message}")]
/// An operation failure carrying its taxonomy kind and, where a backend was
/// involved, the raw output captured for diagnostics.
pub struct Error {
    kind: ErrorKind,
    message: String,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stdout: None,
            stderr: None,
        }
    }

    /// Attach output captured before the failure, e.g. partial stdout of a
    /// timed out command.
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapacityExceeded, message)
    }

    pub fn policy_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyDenied, message)
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendUnavailable, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::IoError, err.to_string())
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Self::new(ErrorKind::InvalidArgument, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Internal, err.to_string())
    }
}

/// Chain creates a string from an error stack.
pub fn chain(res: anyhow::Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}
