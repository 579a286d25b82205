//! gone core - descriptor registry for socket handoff
//!
//! This crate tracks which listening sockets a process inherited from its
//! parent or supervisor, which ones are currently in use, and how to
//! describe the in-use set to a replacement process:
//! - `registry` - the available/active descriptor table
//! - `env` - `LISTEN_FDS`-style inheritance environment codec
//! - `predicate` - tests for picking an inherited socket by family, type or address
//! - `unlink` - stale UNIX socket path policies
//!
//! # Panic-Free Guarantees
//!
//! Production code does not use `.unwrap()`, `.expect()` or `panic!()`;
//! decoding failures of the inheritance environment are recorded on the
//! registry rather than raised.

#[cfg(not(unix))]
compile_error!("gone-core requires a Unix platform");

pub mod env;
pub mod error;
pub mod fd;
pub mod file;
pub mod predicate;
pub mod registry;
pub mod unlink;

// Re-exports for convenience
pub use error::{EnvError, EnvResult, RegistryError, RegistryResult};
pub use file::{Disposition, FileSummary, HandoffFile, HandoffKind, InheritedFile, OwnerToken};
pub use predicate::Predicate;
pub use registry::{ForgetTarget, Registry};
pub use unlink::UnlinkPolicy;
