//! Notify datagram payloads.
//!
//! A datagram is a set of newline-joined `KEY=VALUE` lines.

use std::fmt;

/// One `KEY=VALUE` line of a notify datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyState {
    /// `READY=1`: startup or reload finished.
    Ready,
    /// `RELOADING=1`: configuration reload started.
    Reloading,
    /// `STOPPING=1`: shutdown started.
    Stopping,
    /// `WATCHDOG=1`: liveness ping.
    Watchdog,
    /// `STATUS=...`: free-form status text.
    Status(String),
    /// `MAINPID=...`: the PID the supervisor should track.
    MainPid(u32),
    /// `FDSTORE=1`: the attached descriptors go to the descriptor store.
    FdStore,
    /// `FDNAME=...`: name for the attached descriptors.
    FdName(String),
    /// Any other key.
    Custom { key: String, value: String },
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "READY=1"),
            Self::Reloading => write!(f, "RELOADING=1"),
            Self::Stopping => write!(f, "STOPPING=1"),
            Self::Watchdog => write!(f, "WATCHDOG=1"),
            Self::Status(text) => write!(f, "STATUS={}", single_line(text)),
            Self::MainPid(pid) => write!(f, "MAINPID={pid}"),
            Self::FdStore => write!(f, "FDSTORE=1"),
            Self::FdName(name) => write!(f, "FDNAME={}", single_line(name)),
            Self::Custom { key, value } => write!(f, "{key}={}", single_line(value)),
        }
    }
}

/// Newlines would split a value into bogus extra lines.
fn single_line(value: &str) -> String {
    value.replace('\n', " ")
}

/// Standard lifecycle states for [`Notifier::notify_status`](crate::Notifier::notify_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ready,
    Reloading,
    Stopping,
    Watchdog,
}

impl StatusKind {
    /// Returns the datagram line announcing this state.
    pub fn state(self) -> NotifyState {
        match self {
            Self::Ready => NotifyState::Ready,
            Self::Reloading => NotifyState::Reloading,
            Self::Stopping => NotifyState::Stopping,
            Self::Watchdog => NotifyState::Watchdog,
        }
    }
}

/// An ordered set of notify lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyMessage {
    states: Vec<NotifyState>,
}

impl NotifyMessage {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line.
    pub fn with(mut self, state: NotifyState) -> Self {
        self.states.push(state);
        self
    }

    /// Creates a `STATUS=` message for a lifecycle state.
    pub fn status(kind: StatusKind, text: &str) -> Self {
        let message = Self::new().with(kind.state());
        if text.is_empty() {
            message
        } else {
            message.with(NotifyState::Status(text.to_string()))
        }
    }

    /// Returns true if the message carries no lines.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Returns the lines in order.
    pub fn states(&self) -> &[NotifyState] {
        &self.states
    }

    /// Renders the datagram payload.
    pub fn to_payload(&self) -> String {
        self.states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl FromIterator<NotifyState> for NotifyMessage {
    fn from_iter<I: IntoIterator<Item = NotifyState>>(iter: I) -> Self {
        Self {
            states: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_lines() {
        assert_eq!(NotifyState::Ready.to_string(), "READY=1");
        assert_eq!(NotifyState::Reloading.to_string(), "RELOADING=1");
        assert_eq!(NotifyState::Stopping.to_string(), "STOPPING=1");
        assert_eq!(NotifyState::Watchdog.to_string(), "WATCHDOG=1");
        assert_eq!(NotifyState::MainPid(42).to_string(), "MAINPID=42");
        assert_eq!(NotifyState::FdStore.to_string(), "FDSTORE=1");
        assert_eq!(
            NotifyState::FdName("web".to_string()).to_string(),
            "FDNAME=web"
        );
        assert_eq!(
            NotifyState::Custom {
                key: "ERRNO".to_string(),
                value: "2".to_string()
            }
            .to_string(),
            "ERRNO=2"
        );
    }

    #[test]
    fn test_status_text_stays_on_one_line() {
        let state = NotifyState::Status("two\nlines".to_string());
        assert_eq!(state.to_string(), "STATUS=two lines");
    }

    #[test]
    fn test_payload_is_newline_joined() {
        let message = NotifyMessage::status(StatusKind::Ready, "serving 2 listeners");
        assert_eq!(message.to_payload(), "READY=1\nSTATUS=serving 2 listeners");

        let message = NotifyMessage::status(StatusKind::Stopping, "");
        assert_eq!(message.to_payload(), "STOPPING=1");
    }

    #[test]
    fn test_collect_into_message() {
        let message: NotifyMessage = [NotifyState::FdStore, NotifyState::FdName("a".into())]
            .into_iter()
            .collect();
        assert_eq!(message.states().len(), 2);
        assert!(!message.is_empty());
        assert!(NotifyMessage::new().is_empty());
    }
}
