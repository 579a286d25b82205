//! Registry entry types.

use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::fd::FileIdentity;

/// Opaque handle identifying whoever exported a descriptor.
///
/// Tokens are minted by the registry and never reused within a process, so
/// two exports can only collide if the caller deliberately reuses one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerToken(u64);

impl OwnerToken {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value of the token.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Where a descriptor currently sits in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Inherited (or demoted by a reset) and waiting to be claimed.
    Available,
    /// Exported by a live owner and part of the next handoff.
    Active,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// One descriptor known to the registry.
#[derive(Debug)]
pub(crate) struct RegisteredFile {
    pub(crate) fd: OwnedFd,
    pub(crate) name: String,
    /// Advisory lock guarding the UNIX socket path this descriptor is bound to.
    pub(crate) lock: Option<File>,
    /// Device/inode of the open file, when it could be determined.
    pub(crate) identity: Option<FileIdentity>,
}

impl RegisteredFile {
    pub(crate) fn summary(&self, disposition: Disposition) -> FileSummary {
        FileSummary {
            name: self.name.clone(),
            fd: self.fd.as_raw_fd(),
            disposition,
            locked: self.lock.is_some(),
        }
    }
}

/// A descriptor handed out by [`Registry::file_with`](crate::Registry::file_with).
///
/// The registry no longer tracks it; re-export it to make it part of the
/// next handoff again.
#[derive(Debug)]
pub struct InheritedFile {
    pub fd: OwnedFd,
    pub name: String,
    pub lock: Option<File>,
}

impl AsFd for InheritedFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Kind of descriptor in a handoff list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffKind {
    Socket,
    /// Advisory lock belonging to the preceding socket.
    Lock,
}

/// A duplicated active descriptor, ready to be passed to another process.
#[derive(Debug)]
pub struct HandoffFile {
    pub name: String,
    pub fd: OwnedFd,
    pub kind: HandoffKind,
}

/// Point-in-time view of a registry entry, for status output and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    pub fd: RawFd,
    pub disposition: Disposition,
    pub locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_display_and_order() {
        let a = OwnerToken::new(1);
        let b = OwnerToken::new(2);
        assert!(a < b);
        assert_eq!(a.to_string(), "owner#1");
        assert_eq!(b.get(), 2);
    }

    #[test]
    fn test_disposition_display() {
        assert_eq!(Disposition::Available.to_string(), "available");
        assert_eq!(Disposition::Active.to_string(), "active");
    }
}
