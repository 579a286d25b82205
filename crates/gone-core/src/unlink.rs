//! Stale UNIX socket path handling.
//!
//! Binding a UNIX socket fails if the path already exists, and a crashed
//! process leaves its socket file behind. Before binding a fresh socket the
//! caller picks how aggressively to clear the path.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::fd;

/// How to treat an existing file at a UNIX socket path before binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnlinkPolicy {
    /// Leave the path alone; binding fails if it exists.
    Never,
    /// Remove whatever is there.
    Always,
    /// Remove the path only if `stat` says it is a socket.
    #[default]
    IfSocket,
    /// Take an exclusive lock on `<path>.lock` first and only unlink while
    /// holding it. A live process holding the lock keeps its path.
    Flock,
}

impl UnlinkPolicy {
    /// Returns the configuration spelling of the policy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Always => "always",
            Self::IfSocket => "if-socket",
            Self::Flock => "flock",
        }
    }
}

impl FromStr for UnlinkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "if-socket" => Ok(Self::IfSocket),
            "flock" => Ok(Self::Flock),
            other => Err(format!(
                "unknown unlink policy {other:?} (expected never, always, if-socket or flock)"
            )),
        }
    }
}

/// Returns the sibling lock path for a socket path.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Clears `path` according to `policy` so a fresh socket can be bound there.
///
/// For [`UnlinkPolicy::Flock`] the returned lock file must stay open for as
/// long as the socket is in use; it is the only thing stopping another
/// process from removing the path. Fails with [`io::ErrorKind::AddrInUse`]
/// if another process holds the lock.
pub fn prepare_unix_path(path: &Path, policy: UnlinkPolicy) -> io::Result<Option<File>> {
    match policy {
        UnlinkPolicy::Never => Ok(None),
        UnlinkPolicy::Always => {
            remove_if_exists(path)?;
            Ok(None)
        }
        UnlinkPolicy::IfSocket => {
            match fs::symlink_metadata(path) {
                Ok(meta) if meta.file_type().is_socket() => remove_if_exists(path)?,
                Ok(_) => debug!(path = %path.display(), "Existing path is not a socket, leaving it"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            Ok(None)
        }
        UnlinkPolicy::Flock => {
            let lock = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(lock_path(path))?;
            if !fd::try_lock_exclusive(lock.as_fd())? {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is locked by another process", lock_path(path).display()),
                ));
            }
            remove_if_exists(path)?;
            Ok(Some(lock))
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale socket path");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
