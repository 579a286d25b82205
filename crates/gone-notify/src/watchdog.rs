//! Supervisor liveness pings.
//!
//! The supervisor announces a watchdog through `WATCHDOG_USEC` (the
//! deadline) and optionally `WATCHDOG_PID` (which process must ping). The
//! announcement is read once per process and cached.

use std::sync::OnceLock;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::StatusKind;
use crate::notifier::Notifier;

/// Environment variable carrying the watchdog deadline in microseconds.
pub const WATCHDOG_USEC: &str = "WATCHDOG_USEC";

/// Environment variable naming the process expected to ping.
pub const WATCHDOG_PID: &str = "WATCHDOG_PID";

static WATCHDOG: OnceLock<Option<Watchdog>> = OnceLock::new();

/// A watchdog requested by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
    /// Deadline after which the supervisor considers the process hung.
    pub timeout: Duration,
}

impl Watchdog {
    /// Parses the watchdog announcement for process `pid`.
    ///
    /// Returns `None` if no watchdog is configured, the value is malformed
    /// or zero, or the announcement targets another process.
    pub fn from_lookup<F>(lookup: F, pid: u32) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(WATCHDOG_USEC)?;
        let usec = match raw.trim().parse::<u64>() {
            Ok(0) => return None,
            Ok(usec) => usec,
            Err(e) => {
                warn!(value = %raw, error = %e, "Ignoring malformed WATCHDOG_USEC");
                return None;
            }
        };

        if let Some(target) = lookup(WATCHDOG_PID) {
            match target.trim().parse::<u32>() {
                Ok(target) if target == pid => {}
                Ok(target) => {
                    debug!(target, pid, "Watchdog belongs to another process");
                    return None;
                }
                Err(e) => {
                    warn!(value = %target, error = %e, "Ignoring malformed WATCHDOG_PID");
                    return None;
                }
            }
        }

        Some(Self {
            timeout: Duration::from_micros(usec),
        })
    }

    /// Recommended ping interval: half the deadline.
    pub fn ping_interval(&self) -> Duration {
        self.timeout / 2
    }
}

/// Returns the watchdog the supervisor asked this process for.
///
/// The environment is read on first call only.
pub fn watchdog() -> Option<Watchdog> {
    *WATCHDOG.get_or_init(|| {
        Watchdog::from_lookup(|key| std::env::var(key).ok(), std::process::id())
    })
}

/// Spawns a task that sends `WATCHDOG=1` every `timeout / 2` until
/// `cancel_token` fires.
pub fn spawn_watchdog(
    notifier: Notifier,
    timeout: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let period = (timeout / 2).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = period.as_millis() as u64, "Watchdog pinger started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Watchdog pinger shutting down");
                    break;
                }

                _ = tick.tick() => {
                    if let Err(e) = notifier.notify_status(StatusKind::Watchdog, "") {
                        warn!(error = %e, "Watchdog ping failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_watchdog_parsing() {
        let dog = Watchdog::from_lookup(env(&[("WATCHDOG_USEC", "3000000")]), 7).unwrap();
        assert_eq!(dog.timeout, Duration::from_secs(3));
        assert_eq!(dog.ping_interval(), Duration::from_millis(1500));

        assert!(Watchdog::from_lookup(env(&[]), 7).is_none());
        assert!(Watchdog::from_lookup(env(&[("WATCHDOG_USEC", "0")]), 7).is_none());
        assert!(Watchdog::from_lookup(env(&[("WATCHDOG_USEC", "soon")]), 7).is_none());
    }

    #[test]
    fn test_watchdog_pid_must_match() {
        let vars = &[("WATCHDOG_USEC", "1000"), ("WATCHDOG_PID", "7")];
        assert!(Watchdog::from_lookup(env(vars), 7).is_some());
        assert!(Watchdog::from_lookup(env(vars), 8).is_none());
    }
}
