//! Error types for the network-state database.

use std::io;

use crate::transport::Verb;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, querying or applying network state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error, e.g. from an external check command.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The kernel (or its transport) rejected a request.
    #[error("{kind} {verb}: {message} (errno {errno})")]
    Protocol {
        /// Object family of the request, e.g. "link".
        kind: String,
        /// Request verb.
        verb: Verb,
        /// Positive errno value.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// The change was sent but never showed up in the store.
    #[error("could not apply the changes to {table} {key}")]
    CouldNotApply {
        /// Table of the object.
        table: String,
        /// Rendered object key.
        key: String,
    },

    /// A symbolic reference (interface name) could not be resolved.
    #[error("could not resolve {field} = {reference}")]
    Unresolved {
        /// Field holding the reference.
        field: String,
        /// The unresolved value.
        reference: String,
    },

    /// No record matches the requested key.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Attempt to create an object that already exists.
    #[error("object exists: {0}")]
    ObjectExists(String),

    /// Attempt to change a key field of an object that does not support replacement.
    #[error("attempt to change a key field ({0})")]
    KeyFieldChange(String),

    /// The object state machine refused the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A row references a parent row that is not loaded (yet).
    #[error("{table}: no parent record in {parent}")]
    ForeignKey {
        /// Child table.
        table: &'static str,
        /// Parent table.
        parent: &'static str,
    },

    /// An authorization manager denied access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The database is shutting down.
    #[error("shutdown in progress")]
    Shutdown,

    /// No source registered for the target.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// A source failed and did not recover.
    #[error("source {target} failed: {message}")]
    SourceFailed {
        /// Source target name.
        target: String,
        /// Failure description.
        message: String,
    },

    /// A wait ran past its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Transport-level failure (connection lost, closed channel).
    #[error("transport error: {0}")]
    Transport(String),

    /// A field value could not be parsed or normalized.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// What is wrong with the value.
        message: String,
    },

    /// An external transaction check failed.
    #[error("check failed: {0}")]
    CheckFailed(String),

    /// A commit failed and the rollback failed as well.
    #[error("{source} (rollback failed: {} error(s))", .rollback.len())]
    Rollback {
        /// The original failure.
        source: Box<Error>,
        /// Errors raised while rolling back.
        rollback: Vec<Error>,
    },
}

impl Error {
    /// Create a protocol error from an errno value.
    ///
    /// Accepts both the negative netlink convention and positive errno values.
    pub fn from_errno(kind: impl Into<String>, verb: Verb, errno: i32) -> Self {
        let errno = errno.abs();
        Self::Protocol {
            kind: kind.into(),
            verb,
            errno,
            message: io::Error::from_raw_os_error(errno).to_string(),
        }
    }

    /// Create an invalid value error.
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the errno value if this is a protocol error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Protocol { errno, .. } => Some(*errno),
            Self::Rollback { source, .. } => source.errno(),
            _ => None,
        }
    }

    /// Check if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Protocol { errno, .. } => {
                matches!(*errno, libc::ENOENT | libc::ENODEV | libc::ESRCH)
            }
            Self::KeyNotFound(_) | Self::SourceNotFound(_) => true,
            _ => false,
        }
    }

    /// Check if this is an "already exists" error.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Protocol { errno, .. } => *errno == libc::EEXIST,
            Self::ObjectExists(_) => true,
            _ => false,
        }
    }

    /// Check if this is a permission error.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Protocol { errno, .. } => matches!(*errno, libc::EPERM | libc::EACCES),
            Self::PermissionDenied(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the database is going away.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
