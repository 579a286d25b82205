//! gone notify - supervisor notification client
//!
//! Speaks the `sd_notify` datagram protocol:
//! - `message` - `KEY=VALUE` notify lines
//! - `socket` - datagram transport with descriptor passing
//! - `notifier` - readiness, status and descriptor-store notifications
//! - `watchdog` - liveness ping configuration and pinger task
//!
//! Running without a supervisor is a supported mode. Building a
//! [`Notifier`] then fails with [`NotifyError::NoSocket`], which callers
//! normally log and move past, and the free function [`notify`] returns
//! `Ok(false)` without sending anything.

pub mod error;
pub mod message;
pub mod notifier;
pub mod socket;
pub mod watchdog;

// Re-exports for convenience
pub use error::{NotifyError, NotifyResult};
pub use message::{NotifyMessage, NotifyState, StatusKind};
pub use notifier::{notify, Notifier, NOTIFY_SOCKET};
pub use socket::{NotifyAddr, MAX_FDS_PER_MESSAGE};
pub use watchdog::{spawn_watchdog, watchdog, Watchdog};
