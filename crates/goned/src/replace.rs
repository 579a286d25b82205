//! Process replacement: start a new image of this binary that inherits the
//! active descriptors, and let it retire us once it is serving.
//!
//! The handshake is two-sided:
//! 1. the old process calls [`replace_process`], which spawns the new image
//!    with the descriptors at slots 3.. and `NEWSTYLE_PID`/`NEWSTYLE_SIG`
//!    naming itself and the signal it wants;
//! 2. the new process reads those variables with [`take_handshake`] before
//!    it starts any threads, and calls [`signal_parent_termination`] once it
//!    accepts connections; the old process drains on that signal.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use gone_core::env::{
    handoff_env, INHERITANCE_VARS, LISTEN_FDS_START, LISTEN_PID_IGNORE, NEWSTYLE_PID, NEWSTYLE_SIG,
};
use gone_core::Registry;
use tracing::{debug, info, warn};

use crate::error::ReplaceError;

/// How this process was started.
#[derive(Debug, Clone)]
pub struct Startup {
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    /// `PATH` at startup, for finding a bare argv[0].
    pub search_path: Option<OsString>,
}

static STARTUP: OnceLock<Startup> = OnceLock::new();

/// Records argv and the working directory.
///
/// Call early in `main`, before anything changes directory; later calls
/// return the first recording.
pub fn capture_startup() -> &'static Startup {
    STARTUP.get_or_init(|| Startup {
        args: std::env::args_os().collect(),
        cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        search_path: std::env::var_os("PATH"),
    })
}

/// Resolves the binary to start, with symlinks followed so a redeployed
/// binary is picked up.
///
/// argv[0] is taken relative to the startup directory when it names a
/// path, and looked up in the startup `PATH` when it is a bare name. The
/// running executable is the last resort: after a redeploy by rename it
/// names the old, deleted binary.
pub fn resolve_executable(startup: &Startup) -> Result<PathBuf, ReplaceError> {
    let argv0 = startup.args.first().map(Path::new);
    let found = match argv0 {
        Some(path) if path.components().count() > 1 => Some(startup.cwd.join(path)),
        Some(name) if !name.as_os_str().is_empty() => {
            search_path(name, startup.search_path.as_deref(), &startup.cwd)
        }
        _ => None,
    };
    let candidate = match found {
        Some(path) => path,
        None => std::env::current_exe().map_err(ReplaceError::Executable)?,
    };
    fs::canonicalize(&candidate).map_err(ReplaceError::Executable)
}

/// First executable file called `name` in the `PATH` entries of `path`.
fn search_path(name: &Path, path: Option<&OsStr>, cwd: &Path) -> Option<PathBuf> {
    std::env::split_paths(path?)
        .map(|dir| cwd.join(dir).join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Starts a replacement process that inherits every active descriptor.
///
/// `signal` is what the replacement sends back once it is ready. Returns
/// the child's PID.
pub fn replace_process(registry: &Registry, signal: i32) -> Result<u32, ReplaceError> {
    let startup = capture_startup();
    let path = resolve_executable(startup)?;
    let files = registry.handoff_files()?;

    // Park the duplicates above the target slots so dup2 in the child can
    // never clobber a source it has yet to move.
    let floor = LISTEN_FDS_START + files.len() as RawFd;
    let parked: Vec<OwnedFd> = files
        .iter()
        .map(|file| dup_above(file.fd.as_raw_fd(), floor))
        .collect::<Result<_, _>>()
        .map_err(|source| ReplaceError::Spawn {
            path: path.clone(),
            source,
        })?;
    let sources: Vec<RawFd> = parked.iter().map(AsRawFd::as_raw_fd).collect();

    let mut cmd = Command::new(&path);
    cmd.args(startup.args.iter().skip(1))
        .current_dir(&startup.cwd)
        .env_remove(LISTEN_PID_IGNORE)
        .env_remove(NEWSTYLE_PID)
        .env_remove(NEWSTYLE_SIG);
    for var in INHERITANCE_VARS {
        cmd.env_remove(var);
    }
    cmd.envs(handoff_env(&files))
        .env(NEWSTYLE_PID, std::process::id().to_string())
        .env(NEWSTYLE_SIG, signal.to_string());

    // SAFETY: the closure runs between fork and exec and only calls dup2,
    // which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            for (slot, &source) in sources.iter().enumerate() {
                let target = LISTEN_FDS_START + slot as RawFd;
                if libc::dup2(source, target) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| ReplaceError::Spawn {
        path: path.clone(),
        source,
    })?;
    drop(parked);

    let pid = child.id();
    info!(
        pid,
        path = %path.display(),
        descriptors = files.len(),
        signal,
        "Started replacement process"
    );
    Ok(pid)
}

fn dup_above(fd: RawFd, floor: RawFd) -> std::io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor we own or -1.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `dup` was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// A pending request from the process we are replacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentHandshake {
    pub pid: u32,
    pub signal: i32,
}

/// Reads the handshake variables through `lookup`.
///
/// Returns `Ok(None)` if this process was not started by
/// [`replace_process`].
pub fn parse_handshake<F>(lookup: F) -> Result<Option<ParentHandshake>, ReplaceError>
where
    F: Fn(&str) -> Option<String>,
{
    let (Some(pid), Some(signal)) = (lookup(NEWSTYLE_PID), lookup(NEWSTYLE_SIG)) else {
        return Ok(None);
    };
    let pid = pid
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|p| *p > 1)
        .ok_or(ReplaceError::InvalidHandshake {
            var: NEWSTYLE_PID,
            value: pid,
        })?;
    let signal = signal
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|s| *s > 0)
        .ok_or(ReplaceError::InvalidHandshake {
            var: NEWSTYLE_SIG,
            value: signal,
        })?;
    Ok(Some(ParentHandshake { pid, signal }))
}

/// Reads the handshake from the environment and clears it, so children of
/// this process never act on it.
///
/// Mutates the environment: call from `main` before any other thread
/// exists.
pub fn take_handshake() -> Result<Option<ParentHandshake>, ReplaceError> {
    let handshake = parse_handshake(|key| std::env::var(key).ok());
    std::env::remove_var(NEWSTYLE_PID);
    std::env::remove_var(NEWSTYLE_SIG);
    if let Ok(None) = handshake {
        debug!("No parent waiting for termination signal");
    }
    handshake
}

/// Tells the process we replaced that we are ready, by sending it the
/// signal it asked for.
///
/// # Errors
///
/// - `ReplaceError::ParentMismatch` if our parent is no longer the process
///   that started us (it died, or we were reparented)
/// - `ReplaceError::Signal` if the signal cannot be delivered
pub fn signal_parent_termination(handshake: ParentHandshake) -> Result<(), ReplaceError> {
    // SAFETY: getppid cannot fail.
    let parent = unsafe { libc::getppid() } as u32;
    if parent != handshake.pid {
        warn!(expected = handshake.pid, parent, "Parent changed before handshake");
        return Err(ReplaceError::ParentMismatch {
            expected: handshake.pid,
            actual: parent,
        });
    }

    send_signal(handshake.pid, handshake.signal)?;
    info!(
        pid = handshake.pid,
        signal = handshake.signal,
        "Signalled parent to terminate"
    );
    Ok(())
}

/// Sends `signal` to `pid`.
pub fn send_signal(pid: u32, signal: i32) -> Result<(), ReplaceError> {
    let target = libc::pid_t::try_from(pid).map_err(|_| ReplaceError::Signal {
        pid,
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(target, signal) } < 0 {
        return Err(ReplaceError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
