//! Crate-wide error taxonomy.
//!
//! Every fallible public operation returns [`Result<T>`]. Errors carry a
//! [`ErrorKind`] (the taxonomy from the spec's error handling design) plus an
//! optional boxed cause, so callers can match on kind without downcasting.

use std::fmt;

/// The error kinds surfaced at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// API misuse: invalid UUID, out-of-range parameter, wrong mode, etc.
    InvalidInput,
    /// Filesystem-level failure opening, creating, or locking the file.
    PathError,
    /// I/O failure during append, or the file is already locked for writing.
    WriteError,
    /// I/O failure during read.
    ReadError,
    /// Structural validation failure once a row passed length/sentinel/parity checks.
    CorruptDatabase,
    /// A second `begin_tx` while one is open, or a query against an unterminated transaction.
    TransactionActive,
    /// Lookup found no match.
    KeyNotFound,
    /// Operation not permitted in the component's current lifecycle state.
    InvalidAction,
    /// The component has entered its permanent-failure state.
    Tombstoned,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::PathError => "path error",
            ErrorKind::WriteError => "write error",
            ErrorKind::ReadError => "read error",
            ErrorKind::CorruptDatabase => "corrupt database",
            ErrorKind::TransactionActive => "transaction active",
            ErrorKind::KeyNotFound => "key not found",
            ErrorKind::InvalidAction => "invalid action",
            ErrorKind::Tombstoned => "tombstoned",
        };
        f.write_str(s)
    }
}

/// The crate's error type: a kind, a message, and an optional cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        kind: ErrorKind,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptDatabase, message)
    }

    pub fn tombstoned(cause: Error) -> Self {
        Self {
            kind: ErrorKind::Tombstoned,
            message: format!("component is tombstoned: {}", cause.message),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn key_not_found() -> Self {
        Self::new(ErrorKind::KeyNotFound, "key not found")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PathError
            }
            _ => ErrorKind::ReadError,
        };
        Error::with_cause(kind, "i/o failure", err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
