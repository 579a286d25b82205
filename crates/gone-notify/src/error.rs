//! Error types for supervisor notifications.

use std::io;

use gone_core::RegistryError;
use thiserror::Error;

/// Errors that can occur while notifying the supervisor.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// `NOTIFY_SOCKET` is not set; the process is not supervised.
    #[error("no supervisor notify socket configured")]
    NoSocket,

    /// `NOTIFY_SOCKET` could not be parsed.
    #[error("invalid NOTIFY_SOCKET: {0}")]
    InvalidAddress(String),

    /// Nothing to send.
    #[error("empty notify message")]
    EmptyMessage,

    /// Socket operation failed.
    #[error("notify {op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Collecting descriptors for the store failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl NotifyError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Returns true for the soft "not supervised" failure callers usually
    /// downgrade to a log line.
    pub fn is_no_socket(&self) -> bool {
        matches!(self, Self::NoSocket)
    }
}

/// Result type for notify operations.
pub type NotifyResult<T> = Result<T, NotifyError>;
