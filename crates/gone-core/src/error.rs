//! Error types for the descriptor registry.

use std::io;

use thiserror::Error;

use crate::file::OwnerToken;

/// Errors raised while decoding the inheritance environment.
///
/// These are cloneable so the registry can keep the failure from process
/// start and hand copies to anyone who asks for it later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// A variable was present but could not be parsed.
    #[error("invalid ${var}: {reason}")]
    Invalid {
        /// Name of the offending variable
        var: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// A per-descriptor list did not line up with `LISTEN_FDS`.
    #[error("${var} has {got} entries but LISTEN_FDS says {expected}")]
    LengthMismatch {
        var: &'static str,
        got: usize,
        expected: usize,
    },

    /// An announced descriptor slot is not an open descriptor.
    #[error("inherited fd {fd} is not open")]
    BadDescriptor { fd: i32 },
}

/// Result type for environment decoding.
pub type EnvResult<T> = Result<T, EnvError>;

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The owner token (or the underlying open file) is already active.
    #[error("already exported: {name:?} ({token})")]
    AlreadyExported {
        /// Name the descriptor was exported under
        name: String,
        /// Token that currently owns it
        token: OwnerToken,
    },

    /// Nothing active matched the owner token or name given to `forget`.
    #[error("not exported: {0}")]
    NotExported(String),

    /// The name cannot be represented in `LISTEN_FDNAMES`.
    #[error("invalid descriptor name {0:?}: names may not contain ':' or newlines")]
    InvalidName(String),

    /// The inheritance environment could not be decoded.
    #[error("inheritance environment: {0}")]
    Environment(#[from] EnvError),

    /// A descriptor syscall failed.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    /// Wraps an I/O error with the operation that produced it.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_error_display() {
        let err = EnvError::Invalid {
            var: "LISTEN_FDS",
            reason: "not a number".to_string(),
        };
        assert_eq!(err.to_string(), "invalid $LISTEN_FDS: not a number");

        let err = EnvError::LengthMismatch {
            var: "LISTEN_FDNAMES",
            got: 1,
            expected: 2,
        };
        assert_eq!(
            err.to_string(),
            "$LISTEN_FDNAMES has 1 entries but LISTEN_FDS says 2"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::NotExported("web".to_string());
        assert_eq!(err.to_string(), "not exported: web");

        let err = RegistryError::InvalidName("a:b".to_string());
        assert!(err.to_string().contains("\"a:b\""));

        let err = RegistryError::io("dup", io::Error::from_raw_os_error(libc::EBADF));
        assert!(err.to_string().starts_with("dup failed"));
    }
}
