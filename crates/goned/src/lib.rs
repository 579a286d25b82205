//! goned - generations of socket-serving servers
//!
//! Builds on the `gone-core` registry to run a set of servers that keep
//! their listening sockets across configuration reloads and across a
//! complete replacement of the process:
//! - `listener` - acquire a listener, reusing an inherited socket if one matches
//! - `ensemble` - the managed servers of one generation and their lifecycle
//! - `orchestrator` - reloads, exits and the hand-over between generations
//! - `replace` - start a replacement process and the parent-termination handshake
//! - `status` - a reference server answering with its generation and PID
//! - `config` / `daemon` - the `goned` daemon's configuration and signal wiring
//!
//! # Panic-Free Guarantees
//!
//! Production code does not use `.unwrap()`, `.expect()` or `panic!()`.
//! A managed server that fails is reported through its `serve` result and
//! never takes down the generation's other servers.

#[cfg(not(unix))]
compile_error!("goned requires a Unix platform");

pub mod config;
pub mod daemon;
pub mod ensemble;
pub mod error;
pub mod listener;
pub mod orchestrator;
pub mod replace;
pub mod status;

// Re-exports for convenience
pub use config::{DaemonConfig, ListenerConfig};
pub use daemon::{Daemon, PidFile};
pub use ensemble::{Ensemble, EnsembleState, Listen, ManagedServer, Shutdown, Wait};
pub use error::{BoxError, ConfigError, EnsembleError, ListenError, OrchestratorError, ReplaceError};
pub use listener::{AcquiredListener, Acquirer, Listener, Network};
pub use orchestrator::{
    Configure, ExitMode, GenerationContext, GenerationDefaults, GenerationEvent, Orchestrator,
    OrchestratorHandle,
};
pub use replace::{replace_process, signal_parent_termination, take_handshake, ParentHandshake};
pub use status::StatusServer;
