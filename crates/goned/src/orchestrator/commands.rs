//! Orchestrator requests and events.
//!
//! This module defines the message types exchanged with the reactor:
//! - `ReloadRequest` / `ExitRequest`: requests queued to the reactor
//! - `HandoffRequest`: work that must see the registry between builds
//! - `ExitMode`: how the final generation should be drained
//! - `GenerationEvent`: lifecycle events published to subscribers

use std::fmt;
use std::time::Duration;

use gone_core::Registry;
use tokio::sync::oneshot;

use crate::error::OrchestratorError;

/// Ask the reactor to build the next generation.
///
/// `respond_to` is `None` for fire-and-forget requests from signal handlers.
#[derive(Debug)]
pub struct ReloadRequest {
    pub respond_to: Option<oneshot::Sender<Result<u64, OrchestratorError>>>,
}

/// Work run against the registry by the reactor.
pub type RegistryTask = Box<dyn FnOnce(&Registry) + Send>;

/// Work that reads the registry's active set.
///
/// A build resets the registry and only settles it once the new generation
/// listens, so anything handing descriptors to another process goes through
/// the reactor and runs between builds, never during one.
pub enum HandoffRequest {
    /// Start a replacement process that sends `signal` back once ready.
    Replace {
        signal: i32,
        respond_to: Option<oneshot::Sender<Result<u32, OrchestratorError>>>,
    },

    /// Run a task with the registry as the serving generation left it.
    Inspect(RegistryTask),
}

impl fmt::Debug for HandoffRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace { signal, .. } => {
                f.debug_struct("Replace").field("signal", signal).finish()
            }
            Self::Inspect(_) => f.write_str("Inspect"),
        }
    }
}

/// Ask the reactor to stop the current generation for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest {
    pub graceful: bool,
}

/// How the last generation is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitMode {
    /// Drain in-flight work before closing.
    pub graceful: bool,
    /// Overrides the generation's drain timeout.
    pub timeout: Option<Duration>,
}

impl ExitMode {
    /// Graceful drain bounded by the generation's own timeout.
    pub const GRACEFUL: Self = Self {
        graceful: true,
        timeout: None,
    };

    /// Combines two exit requests: forced wins over graceful and the
    /// shorter timeout wins.
    pub fn merge(self, other: Self) -> Self {
        let timeout = match (self.timeout, other.timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            graceful: self.graceful && other.graceful,
            timeout,
        }
    }
}

/// Events published as generations come and go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// A generation finished listening and is taking over.
    Configured { revision: u64 },

    /// A reload was rejected; `current` keeps serving.
    ReloadFailed { current: u64, error: String },

    /// A generation finished draining and ran its cleanups.
    Retired { revision: u64 },

    /// The orchestrator is shutting down.
    Exiting { graceful: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_mode_merge() {
        let graceful = ExitMode::GRACEFUL;
        let forced = ExitMode {
            graceful: false,
            timeout: None,
        };
        let bounded = ExitMode {
            graceful: true,
            timeout: Some(Duration::from_secs(5)),
        };
        let tighter = ExitMode {
            graceful: true,
            timeout: Some(Duration::from_secs(1)),
        };

        assert!(!graceful.merge(forced).graceful);
        assert!(!forced.merge(graceful).graceful);
        assert_eq!(graceful.merge(bounded).timeout, Some(Duration::from_secs(5)));
        assert_eq!(bounded.merge(tighter).timeout, Some(Duration::from_secs(1)));
        assert_eq!(graceful.merge(graceful), graceful);
    }
}
