//! Thin wrappers around the descriptor syscalls the registry needs.
//!
//! Everything here operates on borrowed descriptors so ownership stays with
//! the caller; nothing in this module closes a descriptor.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// Identity of an open file: device and inode as reported by `fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Returns true if `fd` names an open descriptor.
pub fn is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table entry.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Marks a raw descriptor close-on-exec.
///
/// Used on inherited slots before they are wrapped, so they cannot leak
/// into unrelated children even if decoding the environment fails.
pub fn set_cloexec_raw(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    if flags & libc::FD_CLOEXEC == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    }
    Ok(())
}

/// Puts the open file description behind `fd` into non-blocking mode.
///
/// Returns `true` if the flag had to be set. The flag lives on the open file
/// description, so every duplicate of `fd` observes the change.
pub fn ensure_nonblocking(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let raw = fd.as_raw_fd();
    // SAFETY: F_GETFL/F_SETFL only touch file status flags.
    let flags = cvt(unsafe { libc::fcntl(raw, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(false);
    }
    cvt(unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(true)
}

/// Returns the device/inode pair of `fd` if it is a socket.
///
/// Only sockets have a single identity worth guarding: two independent
/// opens of one regular file share an inode without being the same file.
pub fn socket_identity(fd: BorrowedFd<'_>) -> io::Result<Option<FileIdentity>> {
    let stat = fstat(fd)?;
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Ok(None);
    }
    Ok(Some(FileIdentity {
        dev: stat.st_dev as u64,
        ino: stat.st_ino as u64,
    }))
}

/// Returns true if `fd` refers to a socket.
pub fn is_socket(fd: BorrowedFd<'_>) -> bool {
    fstat(fd)
        .map(|stat| (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
        .unwrap_or(false)
}

/// Returns true if the socket behind `fd` is in the listening state.
pub fn is_listening(fd: BorrowedFd<'_>) -> bool {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len point to properly sized locals.
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    ret == 0 && value != 0
}

/// Takes a non-blocking exclusive `flock` on `fd`.
///
/// Returns `Ok(false)` when another open file description holds the lock.
pub fn try_lock_exclusive(fd: BorrowedFd<'_>) -> io::Result<bool> {
    // SAFETY: flock does not touch memory.
    let ret = unsafe { libc::flock(fd.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

fn fstat(fd: BorrowedFd<'_>) -> io::Result<libc::stat> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fully initialises the buffer on success.
    cvt(unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) })?;
    Ok(unsafe { stat.assume_init() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::net::{TcpListener, UdpSocket};
    use std::os::fd::AsFd;

    #[test]
    fn test_socket_detection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(is_socket(listener.as_fd()));
        assert!(is_listening(listener.as_fd()));

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(is_socket(udp.as_fd()));
        assert!(!is_listening(udp.as_fd()));

        let file = tempfile::tempfile().unwrap();
        assert!(!is_socket(file.as_fd()));
        assert!(!is_listening(file.as_fd()));
    }

    #[test]
    fn test_nonblocking_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(ensure_nonblocking(listener.as_fd()).unwrap());
        assert!(!ensure_nonblocking(listener.as_fd()).unwrap());
    }

    #[test]
    fn test_socket_identity_skips_regular_files() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dup = listener.try_clone().unwrap();
        assert_eq!(
            socket_identity(listener.as_fd()).unwrap(),
            socket_identity(dup.as_fd()).unwrap()
        );
        assert!(socket_identity(listener.as_fd()).unwrap().is_some());

        let file = tempfile::tempfile().unwrap();
        assert_eq!(socket_identity(file.as_fd()).unwrap(), None);
    }

    #[test]
    fn test_flock_is_exclusive_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let first = File::create(&path).unwrap();
        let second = File::open(&path).unwrap();

        assert!(try_lock_exclusive(first.as_fd()).unwrap());
        assert!(!try_lock_exclusive(second.as_fd()).unwrap());
        drop(first);
        assert!(try_lock_exclusive(second.as_fd()).unwrap());
    }

    #[test]
    fn test_is_open() {
        let file = tempfile::tempfile().unwrap();
        assert!(is_open(file.as_raw_fd()));
        assert!(!is_open(-1));
    }
}
