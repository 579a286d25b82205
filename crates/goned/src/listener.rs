//! Listener acquisition: reuse an inherited socket, or bind a fresh one.
//!
//! Every acquired listener is exported back to the registry straight away,
//! so it stays part of the next handoff whether it was inherited or new.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use gone_core::predicate::{self, Predicate};
use gone_core::unlink::prepare_unix_path;
use gone_core::{OwnerToken, Registry, UnlinkPolicy};
use socket2::{Domain, Socket, Type};
use tracing::{debug, info};

use crate::error::{BoxError, ListenError};

/// Backlog for freshly bound stream listeners.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Network families a listener can be requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    /// Returns the configuration spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Unix => "unix",
        }
    }

    /// Returns true for connection-oriented networks.
    pub fn is_stream(self) -> bool {
        !matches!(self, Self::Udp | Self::Udp4 | Self::Udp6)
    }

    /// Returns the address family this network is pinned to, if any.
    fn pinned_domain(self) -> Option<Domain> {
        match self {
            Self::Tcp4 | Self::Udp4 => Some(Domain::IPV4),
            Self::Tcp6 | Self::Udp6 => Some(Domain::IPV6),
            Self::Unix => Some(Domain::UNIX),
            Self::Tcp | Self::Udp => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ListenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "udp" => Ok(Self::Udp),
            "udp4" => Ok(Self::Udp4),
            "udp6" => Ok(Self::Udp6),
            "unix" => Ok(Self::Unix),
            other => Err(ListenError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// A resolved listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Resolves `address` for `network`.
///
/// Inet addresses are `host:port`; an empty host means every local address
/// (`:8080`). UNIX addresses are filesystem paths.
pub fn resolve(network: Network, address: &str) -> Result<Endpoint, ListenError> {
    let invalid = |reason: &str| ListenError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if network == Network::Unix {
        if address.is_empty() {
            return Err(invalid("empty socket path"));
        }
        return Ok(Endpoint::Unix(PathBuf::from(address)));
    }

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let want = network.pinned_domain();

    let addr = if host.is_empty() {
        let ip = match want {
            Some(Domain::IPV6) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, port)
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        SocketAddr::new(ip, port)
    } else {
        (host, port)
            .to_socket_addrs()
            .map_err(|e| invalid(&e.to_string()))?
            .find(|addr| want.map_or(true, |d| d == Domain::for_address(*addr)))
            .ok_or_else(|| invalid("no address of the requested family"))?
    };

    if let Some(domain) = want {
        if domain != Domain::for_address(addr) {
            return Err(invalid("address family does not match network"));
        }
    }
    Ok(Endpoint::Inet(addr))
}

/// Predicates selecting an inherited socket suitable for `network` at
/// `endpoint`.
pub fn predicates_for(network: Network, endpoint: &Endpoint) -> Vec<Predicate> {
    let mut preds = Vec::with_capacity(4);
    if let Some(domain) = network.pinned_domain() {
        preds.push(predicate::socket_domain(domain));
    }
    if network.is_stream() {
        preds.push(predicate::socket_type(Type::STREAM));
        preds.push(predicate::is_listening());
    } else {
        preds.push(predicate::socket_type(Type::DGRAM));
    }
    preds.push(match endpoint {
        Endpoint::Inet(addr) => predicate::bound_to_inet(*addr),
        Endpoint::Unix(path) => predicate::bound_to_unix(path.clone()),
    });
    preds
}

/// A bound socket ready to serve.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
    Unix(UnixListener),
}

impl Listener {
    fn from_fd(network: Network, fd: OwnedFd) -> Self {
        match network {
            Network::Unix => Self::Unix(UnixListener::from(fd)),
            n if n.is_stream() => Self::Tcp(TcpListener::from(fd)),
            _ => Self::Udp(UdpSocket::from(fd)),
        }
    }

    /// Describes the bound address for logs and status output.
    pub fn local_addr(&self) -> String {
        let addr = match self {
            Self::Tcp(l) => l.local_addr().map(|a| a.to_string()),
            Self::Udp(s) => s.local_addr().map(|a| a.to_string()),
            Self::Unix(l) => l.local_addr().map(|a| {
                a.as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(unnamed)".to_string())
            }),
        };
        addr.unwrap_or_else(|e| format!("(unknown: {e})"))
    }

    fn set_nonblocking(&self) -> std::io::Result<()> {
        match self {
            Self::Tcp(l) => l.set_nonblocking(true),
            Self::Udp(s) => s.set_nonblocking(true),
            Self::Unix(l) => l.set_nonblocking(true),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(l) => l.as_fd(),
            Self::Udp(s) => s.as_fd(),
            Self::Unix(l) => l.as_fd(),
        }
    }
}

/// The result of a successful acquisition.
#[derive(Debug)]
pub struct AcquiredListener {
    pub listener: Listener,
    pub name: String,
    /// Token the registry holds the listener's duplicate under.
    pub token: OwnerToken,
    /// True if the socket came from the registry rather than a fresh bind.
    pub inherited: bool,
}

/// One export made through an [`Acquirer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRecord {
    pub token: OwnerToken,
    pub inherited: bool,
}

/// Shared log of the exports made while building one generation.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<ExportRecord>>>);

impl Journal {
    fn push(&self, record: ExportRecord) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Returns a copy of the records so far.
    pub fn records(&self) -> Vec<ExportRecord> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Tokens of sockets that were freshly bound rather than inherited.
    pub fn fresh_tokens(&self) -> Vec<OwnerToken> {
        self.records()
            .into_iter()
            .filter(|r| !r.inherited)
            .map(|r| r.token)
            .collect()
    }
}

/// Acquires listeners against a registry.
///
/// Cheap to clone; clones share the journal.
#[derive(Debug, Clone)]
pub struct Acquirer {
    registry: Arc<Registry>,
    unlink: UnlinkPolicy,
    inherit_only: bool,
    journal: Journal,
}

impl Acquirer {
    /// Creates an acquirer with the default unlink policy that binds fresh
    /// sockets when nothing was inherited.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            unlink: UnlinkPolicy::default(),
            inherit_only: false,
            journal: Journal::default(),
        }
    }

    /// Sets how stale UNIX socket paths are cleared before a fresh bind.
    pub fn with_unlink_policy(mut self, policy: UnlinkPolicy) -> Self {
        self.unlink = policy;
        self
    }

    /// Refuses fresh binds; only inherited sockets are handed out.
    pub fn with_inherit_only(mut self, inherit_only: bool) -> Self {
        self.inherit_only = inherit_only;
        self
    }

    /// Records every export into `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Acquires a listener named `name` for `network` at `address`.
    ///
    /// # Errors
    ///
    /// - `ListenError::NoListener` if inheritance is required and nothing matched
    /// - `ListenError::UnsupportedNetwork` / `InvalidAddress` for bad requests
    /// - `ListenError::Io` if a fresh bind fails
    /// - `ListenError::Registry` if the export fails
    pub fn acquire(
        &self,
        name: &str,
        network: &str,
        address: &str,
    ) -> Result<AcquiredListener, ListenError> {
        self.acquire_matching(name, network, address, Vec::new())
    }

    /// Like [`acquire`](Self::acquire), with extra predicates an inherited
    /// candidate must also satisfy.
    pub fn acquire_matching(
        &self,
        name: &str,
        network: &str,
        address: &str,
        extra: Vec<Predicate>,
    ) -> Result<AcquiredListener, ListenError> {
        let net: Network = network.parse()?;
        let endpoint = resolve(net, address)?;
        let mut preds = predicates_for(net, &endpoint);
        preds.extend(extra);

        if let Some(file) = self.registry.file_with(name, &preds) {
            let listener = Listener::from_fd(net, file.fd);
            let token = self.registry.mint_token();
            self.registry
                .export_as(token, name, &listener, file.lock)?;
            self.journal.push(ExportRecord {
                token,
                inherited: true,
            });
            self.finish(&listener, address)?;
            info!(name, %net, addr = %listener.local_addr(), %token, "Reusing inherited listener");
            return Ok(AcquiredListener {
                listener,
                name: name.to_string(),
                token,
                inherited: true,
            });
        }

        if self.inherit_only {
            return Err(ListenError::NoListener {
                name: name.to_string(),
                network: network.to_string(),
                address: address.to_string(),
            });
        }

        let (listener, lock) = self.bind_fresh(net, &endpoint, address)?;
        let token = self.registry.mint_token();
        self.registry.export_as(token, name, &listener, lock)?;
        self.journal.push(ExportRecord {
            token,
            inherited: false,
        });
        self.finish(&listener, address)?;
        info!(name, %net, addr = %listener.local_addr(), %token, "Bound fresh listener");
        Ok(AcquiredListener {
            listener,
            name: name.to_string(),
            token,
            inherited: false,
        })
    }

    /// Acquires a listener and passes it through `wrap` (to add a TLS
    /// layer, say) before returning it.
    pub fn acquire_wrapped<T, F>(
        &self,
        name: &str,
        network: &str,
        address: &str,
        wrap: F,
    ) -> Result<T, ListenError>
    where
        F: FnOnce(AcquiredListener) -> Result<T, BoxError>,
    {
        let acquired = self.acquire(name, network, address)?;
        let token = acquired.token;
        wrap(acquired).map_err(|source| {
            // The wrapped listener is gone, so its registry copy must go too.
            let _ = self.registry.forget(token);
            ListenError::Wrap {
                name: name.to_string(),
                source,
            }
        })
    }

    fn finish(&self, listener: &Listener, address: &str) -> Result<(), ListenError> {
        listener.set_nonblocking().map_err(|source| ListenError::Io {
            op: "fcntl",
            address: address.to_string(),
            source,
        })
    }

    fn bind_fresh(
        &self,
        network: Network,
        endpoint: &Endpoint,
        address: &str,
    ) -> Result<(Listener, Option<std::fs::File>), ListenError> {
        let io_err = |op: &'static str| {
            let address = address.to_string();
            move |source| ListenError::Io {
                op,
                address,
                source,
            }
        };

        match endpoint {
            Endpoint::Unix(path) => {
                let lock = prepare_unix_path(path, self.unlink).map_err(io_err("unlink"))?;
                let listener = bind_unix(path).map_err(io_err("bind"))?;
                Ok((Listener::Unix(listener), lock))
            }
            Endpoint::Inet(addr) => {
                let listener = bind_inet(network, *addr).map_err(io_err("bind"))?;
                Ok((listener, None))
            }
        }
    }
}

fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&socket2::SockAddr::unix(path)?)?;
    socket.listen(LISTEN_BACKLOG)?;
    debug!(path = %path.display(), "Bound UNIX listener");
    Ok(std::os::fd::OwnedFd::from(socket).into())
}

fn bind_inet(network: Network, addr: SocketAddr) -> std::io::Result<Listener> {
    let domain = Domain::for_address(addr);
    let ty = if network.is_stream() {
        Type::STREAM
    } else {
        Type::DGRAM
    };
    let socket = Socket::new(domain, ty, None)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(network.pinned_domain().is_some())?;
    }
    if network.is_stream() {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;

    if network.is_stream() {
        socket.listen(LISTEN_BACKLOG)?;
        Ok(Listener::Tcp(socket.into()))
    } else {
        Ok(Listener::Udp(socket.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        for net in [
            Network::Tcp,
            Network::Tcp4,
            Network::Tcp6,
            Network::Udp,
            Network::Udp4,
            Network::Udp6,
            Network::Unix,
        ] {
            assert_eq!(net.as_str().parse::<Network>().unwrap(), net);
        }
        assert!(matches!(
            "sctp".parse::<Network>(),
            Err(ListenError::UnsupportedNetwork(n)) if n == "sctp"
        ));
        assert!(Network::Unix.is_stream());
        assert!(!Network::Udp6.is_stream());
    }

    #[test]
    fn test_resolve_wildcards() {
        assert_eq!(
            resolve(Network::Tcp, ":8080").unwrap(),
            Endpoint::Inet("0.0.0.0:8080".parse().unwrap())
        );
        assert_eq!(
            resolve(Network::Tcp6, ":8080").unwrap(),
            Endpoint::Inet("[::]:8080".parse().unwrap())
        );
        assert_eq!(
            resolve(Network::Udp, "[::1]:53").unwrap(),
            Endpoint::Inet("[::1]:53".parse().unwrap())
        );
        assert_eq!(
            resolve(Network::Unix, "/run/app.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/run/app.sock"))
        );
    }

    #[test]
    fn test_resolve_rejects_bad_addresses() {
        assert!(resolve(Network::Tcp, "8080").is_err());
        assert!(resolve(Network::Tcp, "host:http").is_err());
        assert!(resolve(Network::Tcp4, "[::1]:80").is_err());
        assert!(resolve(Network::Unix, "").is_err());
    }

    #[test]
    fn test_fresh_bind_is_exported() {
        let registry = Arc::new(Registry::new());
        let acquirer = Acquirer::new(Arc::clone(&registry));

        let acquired = acquirer.acquire("web", "tcp", "127.0.0.1:0").unwrap();
        assert!(!acquired.inherited);
        assert!(registry.is_active(acquired.token));
        assert_eq!(acquirer.journal().fresh_tokens(), vec![acquired.token]);
    }

    #[test]
    fn test_inherit_only_without_candidates() {
        let registry = Arc::new(Registry::new());
        let acquirer = Acquirer::new(registry).with_inherit_only(true);

        let err = acquirer.acquire("web", "tcp", ":8080").unwrap_err();
        assert!(matches!(err, ListenError::NoListener { name, .. } if name == "web"));
    }

    #[test]
    fn test_wrap_failure_forgets_export() {
        let registry = Arc::new(Registry::new());
        let acquirer = Acquirer::new(Arc::clone(&registry));

        let err = acquirer
            .acquire_wrapped("web", "tcp", "127.0.0.1:0", |_| -> Result<(), BoxError> {
                Err("handshake setup failed".into())
            })
            .unwrap_err();
        assert!(matches!(err, ListenError::Wrap { .. }));
        assert_eq!(registry.active_count(), 0);
    }
}
