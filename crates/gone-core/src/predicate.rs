//! Boolean tests over raw descriptors, used to pick inherited files.
//!
//! Predicates never take ownership and never fail: anything that cannot be
//! inspected simply does not match.

use std::net::SocketAddr;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;

use socket2::{Domain, SockRef, Type};

use crate::fd;

/// A test applied to a candidate descriptor.
pub type Predicate = Box<dyn Fn(BorrowedFd<'_>) -> bool + Send + Sync>;

/// Matches any socket.
pub fn is_socket() -> Predicate {
    Box::new(fd::is_socket)
}

/// Matches sockets in the listening state.
pub fn is_listening() -> Predicate {
    Box::new(fd::is_listening)
}

/// Matches sockets of the given address family.
pub fn socket_domain(domain: Domain) -> Predicate {
    Box::new(move |fd: BorrowedFd<'_>| {
        fd::is_socket(fd)
            && SockRef::from(&fd)
                .local_addr()
                .map(|addr| addr.domain() == domain)
                .unwrap_or(false)
    })
}

/// Matches sockets of the given type (stream, datagram, ...).
pub fn socket_type(ty: Type) -> Predicate {
    Box::new(move |fd: BorrowedFd<'_>| {
        fd::is_socket(fd)
            && SockRef::from(&fd)
                .r#type()
                .map(|t| t == ty)
                .unwrap_or(false)
    })
}

/// Matches IP sockets bound to `want`.
///
/// An unspecified IP in `want` matches any local address of the same family
/// and an unspecified address of the other family (dual-stack wildcard); a
/// zero port matches any port.
pub fn bound_to_inet(want: SocketAddr) -> Predicate {
    Box::new(move |fd: BorrowedFd<'_>| {
        if !fd::is_socket(fd) {
            return false;
        }
        match SockRef::from(&fd).local_addr().map(|a| a.as_socket()) {
            Ok(Some(got)) => inet_matches(want, got),
            _ => false,
        }
    })
}

fn inet_matches(want: SocketAddr, got: SocketAddr) -> bool {
    if want.port() != 0 && want.port() != got.port() {
        return false;
    }
    if want.ip().is_unspecified() {
        return got.ip().is_unspecified() || want.is_ipv4() == got.is_ipv4();
    }
    want.ip() == got.ip()
}

/// Matches UNIX sockets bound to `path`.
///
/// Relative paths are compared as given; callers wanting robustness against
/// differing working directories should pass absolute paths.
pub fn bound_to_unix(path: impl Into<PathBuf>) -> Predicate {
    let want = path.into();
    Box::new(move |fd: BorrowedFd<'_>| {
        if !fd::is_socket(fd) {
            return false;
        }
        match SockRef::from(&fd).local_addr() {
            Ok(addr) => addr.as_pathname() == Some(want.as_path()),
            Err(_) => false,
        }
    })
}

/// Applies every predicate in order, short-circuiting on the first miss.
pub fn all(predicates: &[Predicate], fd: BorrowedFd<'_>) -> bool {
    predicates.iter().all(|p| p(fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, UdpSocket};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_type_and_domain() {
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();

        assert!(socket_type(Type::STREAM)(tcp.as_fd()));
        assert!(!socket_type(Type::STREAM)(udp.as_fd()));
        assert!(socket_type(Type::DGRAM)(udp.as_fd()));
        assert!(socket_domain(Domain::IPV4)(tcp.as_fd()));
        assert!(!socket_domain(Domain::UNIX)(tcp.as_fd()));
        assert!(is_listening()(tcp.as_fd()));
        assert!(!is_listening()(udp.as_fd()));
    }

    #[test]
    fn test_inet_address_matching() {
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();

        assert!(bound_to_inet(addr)(tcp.as_fd()));
        assert!(bound_to_inet("127.0.0.1:0".parse().unwrap())(tcp.as_fd()));
        assert!(!bound_to_inet("127.0.0.2:0".parse().unwrap())(tcp.as_fd()));

        let other_port = SocketAddr::new(addr.ip(), addr.port().wrapping_add(1));
        assert!(!bound_to_inet(other_port)(tcp.as_fd()));
    }

    #[test]
    fn test_wildcard_matching() {
        let any4: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        let any6: SocketAddr = "[::]:8080".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        assert!(inet_matches(any4, any6));
        assert!(inet_matches(any6, any4));
        assert!(inet_matches(any4, local));
        assert!(!inet_matches(any6, local));
        assert!(!inet_matches(local, any4));
    }

    #[test]
    fn test_unix_path_matching() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = UnixListener::bind(&path).unwrap();

        assert!(bound_to_unix(&path)(listener.as_fd()));
        assert!(!bound_to_unix(dir.path().join("other.sock"))(listener.as_fd()));
        assert!(socket_domain(Domain::UNIX)(listener.as_fd()));
    }

    #[test]
    fn test_non_sockets_never_match() {
        let file = tempfile::tempfile().unwrap();
        assert!(!is_socket()(file.as_fd()));
        assert!(!socket_type(Type::STREAM)(file.as_fd()));
        assert!(!bound_to_inet("0.0.0.0:0".parse().unwrap())(file.as_fd()));
        assert!(!bound_to_unix("/tmp/x")(file.as_fd()));
    }

    #[test]
    fn test_all_short_circuits() {
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let preds = vec![is_socket(), socket_type(Type::DGRAM)];
        assert!(!all(&preds, tcp.as_fd()));
        assert!(all(&[], tcp.as_fd()));
    }
}
