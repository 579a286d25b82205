//! Error types for the goned crate.
//!
//! One enum per concern; managed servers report their own failures as
//! [`BoxError`] and the ensemble wraps them with the server's description.

use std::io;
use std::path::PathBuf;

use gone_core::RegistryError;
use thiserror::Error;

/// Type-erased error returned by managed servers and configuration functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from listener acquisition.
#[derive(Debug, Error)]
pub enum ListenError {
    /// Inheritance was required and nothing matched.
    #[error("no inherited listener named {name:?} for {network} {address}")]
    NoListener {
        name: String,
        network: String,
        address: String,
    },

    /// Unknown network name.
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// The address could not be parsed or resolved.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Creating, binding or inspecting the socket failed.
    #[error("{op} {address} failed: {source}")]
    Io {
        op: &'static str,
        address: String,
        #[source]
        source: io::Error,
    },

    /// Registering the listener failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The caller's post-processing hook rejected the listener.
    #[error("wrapping listener {name:?} failed: {source}")]
    Wrap {
        name: String,
        #[source]
        source: BoxError,
    },
}

/// Errors from process replacement and the parent-termination handshake.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Snapshotting the active descriptors failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The running binary could not be located.
    #[error("cannot resolve current executable: {0}")]
    Executable(#[source] io::Error),

    /// Spawning the replacement failed.
    #[error("spawning {path} failed: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A handshake variable was malformed.
    #[error("invalid {var}: {value:?}")]
    InvalidHandshake { var: &'static str, value: String },

    /// Our parent is not the process that started the handshake.
    #[error("parent pid {actual} does not match handshake pid {expected}")]
    ParentMismatch { expected: u32, actual: u32 },

    /// Delivering the signal failed.
    #[error("signalling pid {pid} failed: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Errors from a server ensemble.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// A member's listen step failed.
    #[error("{server}: listen failed: {source}")]
    Listen {
        server: String,
        #[source]
        source: BoxError,
    },

    /// A member's serve loop failed.
    #[error("{server}: serve failed: {source}")]
    Serve {
        server: String,
        #[source]
        source: BoxError,
    },

    /// A member's graceful shutdown failed.
    #[error("{server}: shutdown failed: {source}")]
    Shutdown {
        server: String,
        #[source]
        source: BoxError,
    },

    /// A member's forced close failed.
    #[error("{server}: close failed: {source}")]
    Close {
        server: String,
        #[source]
        source: BoxError,
    },

    /// The shutdown deadline passed with members still draining.
    #[error("shutdown deadline exceeded")]
    DeadlineExceeded,

    /// The operation is not valid in the ensemble's current state.
    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },
}

/// Errors from the generation orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Building the first generation failed.
    #[error("initial configuration failed: {0}")]
    InitialConfigure(#[source] BoxError),

    /// The first generation could not open its listeners.
    #[error("initial listen failed: {0}")]
    InitialListen(#[source] EnsembleError),

    /// A reload was rejected; the previous generation keeps serving.
    #[error("reload failed: {0}")]
    ReloadFailed(String),

    /// Starting a replacement process failed.
    #[error("process replacement failed: {0}")]
    Replace(#[from] ReplaceError),

    /// The orchestrator is exiting and accepts no more reloads.
    #[error("orchestrator is exiting")]
    Exiting,

    /// The orchestrator task is gone.
    #[error("orchestrator channel closed")]
    ChannelClosed,
}

/// Errors from loading daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for the schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The file parsed but describes an unusable configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// No path was given and no default location exists.
    #[error("no configuration path and no user config directory")]
    NoPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ListenError::NoListener {
            name: "web".to_string(),
            network: "tcp".to_string(),
            address: ":8080".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no inherited listener named \"web\" for tcp :8080"
        );

        let err = EnsembleError::InvalidState {
            op: "serve",
            state: "unconfigured",
        };
        assert_eq!(err.to_string(), "cannot serve while unconfigured");

        let err = ReplaceError::ParentMismatch {
            expected: 10,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "parent pid 1 does not match handshake pid 10"
        );
    }
}
