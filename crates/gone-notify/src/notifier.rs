//! Supervisor notify client.

use std::collections::BTreeMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;

use gone_core::{HandoffFile, HandoffKind, Registry};
use tracing::{debug, trace};

use crate::error::{NotifyError, NotifyResult};
use crate::message::{NotifyMessage, NotifyState, StatusKind};
use crate::socket::{self, NotifyAddr, MAX_FDS_PER_MESSAGE};

/// Environment variable naming the supervisor's notify socket.
pub const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

/// Sends notify datagrams to the supervisor.
///
/// Every send uses a fresh unbound datagram socket, so a `Notifier` is
/// cheap to clone and safe to share between tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notifier {
    addr: NotifyAddr,
}

impl Notifier {
    /// Creates a notifier for an explicit address.
    pub fn new(addr: NotifyAddr) -> Self {
        Self { addr }
    }

    /// Creates a notifier from `NOTIFY_SOCKET`.
    ///
    /// # Errors
    ///
    /// - `NotifyError::NoSocket` if the variable is unset or empty
    /// - `NotifyError::InvalidAddress` if it cannot be parsed
    pub fn from_env() -> NotifyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates a notifier from an arbitrary environment lookup.
    pub fn from_lookup<F>(lookup: F) -> NotifyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(NOTIFY_SOCKET)
            .filter(|value| !value.is_empty())
            .ok_or(NotifyError::NoSocket)?;
        let addr = raw.parse().map_err(NotifyError::InvalidAddress)?;
        Ok(Self { addr })
    }

    /// Returns the supervisor address.
    pub fn addr(&self) -> &NotifyAddr {
        &self.addr
    }

    /// Sends `message` as a single datagram.
    pub fn notify(&self, message: &NotifyMessage) -> NotifyResult<()> {
        if message.is_empty() {
            return Err(NotifyError::EmptyMessage);
        }
        self.send(&message.to_payload(), &[])
    }

    /// Sends a lifecycle state plus a `STATUS=` line.
    pub fn notify_status(&self, kind: StatusKind, text: &str) -> NotifyResult<()> {
        self.notify(&NotifyMessage::status(kind, text))
    }

    /// Tells the supervisor to track `pid` as the main process.
    pub fn notify_main_pid(&self, pid: u32) -> NotifyResult<()> {
        self.notify(&NotifyMessage::new().with(NotifyState::MainPid(pid)))
    }

    /// Sends `message` and pushes every active registry descriptor to the
    /// supervisor's descriptor store.
    ///
    /// Descriptors are grouped by name with one datagram per group (split
    /// further if a group exceeds what one datagram can carry), each tagged
    /// `FDSTORE=1` and, for named groups, `FDNAME=<name>`. The lines of
    /// `message` ride along on every datagram. Advisory lock files are not
    /// sent; they only matter to a direct child.
    ///
    /// Returns the number of datagrams sent.
    pub fn notify_with_fds(
        &self,
        message: &NotifyMessage,
        registry: &Registry,
    ) -> NotifyResult<usize> {
        let files = registry.handoff_files()?;
        let groups = group_by_name(&files);
        if groups.is_empty() {
            self.notify(message)?;
            return Ok(1);
        }

        let mut sent = 0;
        for (name, fds) in groups {
            let mut tagged = message.clone().with(NotifyState::FdStore);
            if !name.is_empty() {
                tagged = tagged.with(NotifyState::FdName(name.to_string()));
            }
            let payload = tagged.to_payload();
            for chunk in fds.chunks(MAX_FDS_PER_MESSAGE) {
                self.send(&payload, chunk)?;
                sent += 1;
            }
            debug!(name, count = fds.len(), "Pushed descriptors to store");
        }
        Ok(sent)
    }

    fn send(&self, payload: &str, fds: &[BorrowedFd<'_>]) -> NotifyResult<()> {
        let sock = UnixDatagram::unbound().map_err(|e| NotifyError::io("socket", e))?;
        socket::send_datagram(&sock, &self.addr, payload.as_bytes(), fds)
            .map_err(|e| NotifyError::io("sendmsg", e))?;
        trace!(payload, fds = fds.len(), "Sent notify datagram");
        Ok(())
    }
}

/// Groups socket descriptors by name, keeping the empty name for
/// anonymous descriptors.
fn group_by_name(files: &[HandoffFile]) -> BTreeMap<&str, Vec<BorrowedFd<'_>>> {
    let mut groups: BTreeMap<&str, Vec<BorrowedFd<'_>>> = BTreeMap::new();
    for file in files.iter().filter(|f| f.kind == HandoffKind::Socket) {
        groups
            .entry(file.name.as_str())
            .or_default()
            .push(file.fd.as_fd());
    }
    groups
}

/// Sends `message` if the process is supervised.
///
/// Returns `Ok(false)` when `NOTIFY_SOCKET` is unset.
pub fn notify(message: &NotifyMessage) -> NotifyResult<bool> {
    send_if_supervised(Notifier::from_env(), message)
}

fn send_if_supervised(
    notifier: NotifyResult<Notifier>,
    message: &NotifyMessage,
) -> NotifyResult<bool> {
    match notifier {
        Ok(notifier) => notifier.notify(message).map(|()| true),
        Err(NotifyError::NoSocket) => Ok(false),
        Err(e) => Err(e),
    }
}
