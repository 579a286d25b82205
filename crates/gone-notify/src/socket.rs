//! Datagram transport to the supervisor, with optional `SCM_RIGHTS`.
//!
//! Stable Rust has no ancillary-data API, so the message is assembled and
//! sent with `libc::sendmsg` directly.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::str::FromStr;

/// Largest number of descriptors the kernel accepts in one message.
pub const MAX_FDS_PER_MESSAGE: usize = 253;

/// Address of the supervisor's notify socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyAddr {
    /// A filesystem path.
    Path(PathBuf),
    /// A Linux abstract-namespace name (written `@name`).
    Abstract(Vec<u8>),
}

impl FromStr for NotifyAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty notify socket address".to_string());
        }
        match s.strip_prefix('@') {
            Some(name) => Ok(Self::Abstract(name.as_bytes().to_vec())),
            None => Ok(Self::Path(PathBuf::from(s))),
        }
    }
}

impl NotifyAddr {
    /// Builds the `sockaddr_un` for this address.
    fn to_sockaddr(&self) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
        // SAFETY: sockaddr_un is plain old data; all-zeroes is a valid value.
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let (bytes, offset): (&[u8], usize) = match self {
            Self::Path(path) => (path.as_os_str().as_encoded_bytes(), 0),
            // Abstract names start with a NUL byte.
            Self::Abstract(name) => (name.as_slice(), 1),
        };

        // Paths need room for a terminating NUL.
        let needed = offset + bytes.len() + usize::from(offset == 0);
        if needed > addr.sun_path.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "notify socket address is too long",
            ));
        }
        for (dst, src) in addr.sun_path[offset..].iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        let base = std::mem::offset_of!(libc::sockaddr_un, sun_path);
        let len = match self {
            Self::Path(_) => base + bytes.len() + 1,
            Self::Abstract(_) => base + 1 + bytes.len(),
        };
        Ok((addr, len as libc::socklen_t))
    }
}

/// Sends one datagram to `addr`, attaching `fds` as `SCM_RIGHTS`.
pub fn send_datagram(
    socket: &UnixDatagram,
    addr: &NotifyAddr,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> io::Result<()> {
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot pass {} descriptors in one message", fds.len()),
        ));
    }

    let (mut sockaddr, socklen) = addr.to_sockaddr()?;

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let data_len = std::mem::size_of_val(raw.as_slice());
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(data_len as libc::c_uint) } as usize;
    // u64 storage keeps the control buffer aligned for cmsghdr.
    let mut control = vec![0u64; space.div_ceil(std::mem::size_of::<u64>())];

    // SAFETY: msghdr is plain old data; all-zeroes is a valid value.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = (&mut sockaddr as *mut libc::sockaddr_un).cast();
    msg.msg_namelen = socklen;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !raw.is_empty() {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        // SAFETY: the control buffer is CMSG_SPACE(data_len) bytes and
        // suitably aligned, so the first header and its data fit.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::other("control buffer too small"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as libc::c_uint) as _;
            std::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                raw.len(),
            );
        }
    }

    // SAFETY: every pointer in msg refers to a live local buffer.
    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "/run/systemd/notify".parse::<NotifyAddr>().unwrap(),
            NotifyAddr::Path(PathBuf::from("/run/systemd/notify"))
        );
        assert_eq!(
            "@supervisor".parse::<NotifyAddr>().unwrap(),
            NotifyAddr::Abstract(b"supervisor".to_vec())
        );
        assert!("".parse::<NotifyAddr>().is_err());
    }

    #[test]
    fn test_overlong_path_rejected() {
        let long = NotifyAddr::Path(PathBuf::from("/".repeat(200)));
        let err = long.to_sockaddr().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_plain_datagram_reaches_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let server = UnixDatagram::bind(&path).unwrap();
        let client = UnixDatagram::unbound().unwrap();

        send_datagram(&client, &NotifyAddr::Path(path), b"READY=1", &[]).unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }
}
