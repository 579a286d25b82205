//! Reference managed server: a line-oriented status endpoint.
//!
//! Every request line is answered with `revision=<n> pid=<pid> name=<name>`,
//! which makes it easy to watch generations and process replacements take
//! over a shared socket. Datagram listeners answer each datagram instead.
//!
//! The server never unlinks its UNIX socket path on the way out: the path
//! belongs to the socket, and the socket outlives this generation.

mod connection;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::ensemble::{Listen, ManagedServer, Shutdown, Wait};
use crate::error::BoxError;
use crate::listener::{Acquirer, Listener};

/// Largest datagram request read.
const MAX_DATAGRAM: usize = 4096;

/// Status endpoint for one configured listener.
pub struct StatusServer {
    name: String,
    network: String,
    address: String,
    acquirer: Acquirer,
    reply: Arc<str>,
    listener: Mutex<Option<Listener>>,
    connections: TaskTracker,
    /// Stops connections between requests.
    idle: CancellationToken,
    /// Stops everything immediately.
    abort: CancellationToken,
}

impl StatusServer {
    /// Creates a status server for generation `revision`. Nothing is bound
    /// until [`Listen::listen`] runs.
    pub fn new(
        acquirer: Acquirer,
        revision: u64,
        name: impl Into<String>,
        network: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let reply = format!(
            "revision={revision} pid={} name={name}",
            std::process::id()
        );
        Self {
            name,
            network: network.into(),
            address: address.into(),
            acquirer,
            reply: Arc::from(reply),
            listener: Mutex::new(None),
            connections: TaskTracker::new(),
            idle: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// The line sent in reply to each request.
    pub fn reply(&self) -> &str {
        &self.reply
    }

    fn take_listener(&self) -> Option<Listener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn spawn_connection<S>(&self, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let reply = Arc::clone(&self.reply);
        let idle = self.idle.clone();
        let abort = self.abort.clone();
        self.connections.spawn(async move {
            connection::serve_connection(stream, &reply, idle, abort).await;
        });
    }

    async fn serve_tcp(&self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = self.abort.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(name = %self.name, %peer, "Status connection");
                        self.spawn_connection(stream);
                    }
                    Err(e) => error!(name = %self.name, error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    async fn serve_unix(&self, listener: UnixListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = self.abort.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!(name = %self.name, "Status connection");
                        self.spawn_connection(stream);
                    }
                    Err(e) => error!(name = %self.name, error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    async fn serve_udp(&self, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = self.abort.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((_, peer)) => {
                        if let Err(e) = socket.send_to(self.reply.as_bytes(), peer).await {
                            debug!(name = %self.name, %peer, error = %e, "Status reply failed");
                        }
                    }
                    Err(e) => error!(name = %self.name, error = %e, "Failed to receive datagram"),
                },
            }
        }
    }
}

#[async_trait]
impl ManagedServer for StatusServer {
    async fn serve(&self, cancel: CancellationToken) -> Result<(), BoxError> {
        let listener = self
            .take_listener()
            .ok_or_else(|| format!("{}: serve called before listen", self.describe()))?;

        info!(name = %self.name, addr = %listener.local_addr(), "Status server serving");
        match listener {
            Listener::Tcp(l) => self.serve_tcp(TcpListener::from_std(l)?, cancel).await,
            Listener::Unix(l) => self.serve_unix(UnixListener::from_std(l)?, cancel).await,
            Listener::Udp(s) => self.serve_udp(UdpSocket::from_std(s)?, cancel).await,
        }
        debug!(name = %self.name, "Status server stopped accepting");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("status[{} {} {}]", self.name, self.network, self.address)
    }

    fn as_listen(&self) -> Option<&dyn Listen> {
        Some(self)
    }

    fn as_shutdown(&self) -> Option<&dyn Shutdown> {
        Some(self)
    }

    fn as_wait(&self) -> Option<&dyn Wait> {
        Some(self)
    }
}

#[async_trait]
impl Listen for StatusServer {
    async fn listen(&self) -> Result<(), BoxError> {
        let acquired = self
            .acquirer
            .acquire(&self.name, &self.network, &self.address)?;
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(acquired.listener);
        Ok(())
    }
}

#[async_trait]
impl Shutdown for StatusServer {
    async fn shutdown(&self, deadline: Option<Instant>) -> Result<(), BoxError> {
        drop(self.take_listener());
        self.idle.cancel();
        self.connections.close();

        let remaining = self.connections.len();
        if remaining > 0 {
            debug!(name = %self.name, remaining, "Waiting for status connections");
        }
        match deadline {
            Some(deadline) => timeout_at(deadline, self.connections.wait())
                .await
                .map_err(|_| format!("{} connection(s) still open at deadline", self.connections.len()))?,
            None => self.connections.wait().await,
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        drop(self.take_listener());
        self.abort.cancel();
        self.idle.cancel();
        self.connections.close();
        self.connections.wait().await;
        Ok(())
    }
}

#[async_trait]
impl Wait for StatusServer {
    async fn wait(&self) {
        self.connections.close();
        self.connections.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gone_core::Registry;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_serve_answers_and_shutdown_waits() {
        let registry = Arc::new(Registry::new());
        let acquirer = Acquirer::new(Arc::clone(&registry));
        let server = Arc::new(StatusServer::new(acquirer, 7, "web", "tcp", "127.0.0.1:0"));

        server.listen().await.unwrap();
        let addr = {
            let guard = server.listener.lock().unwrap();
            guard.as_ref().unwrap().local_addr()
        };

        let cancel = CancellationToken::new();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            async move { server.serve(cancel).await }
        });

        let stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"hello\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert_eq!(reply, format!("revision=7 pid={} name=web", std::process::id()));

        cancel.cancel();
        serving.await.unwrap().unwrap();

        // The open connection is idle, so a graceful shutdown ends it.
        server
            .shutdown(Some(Instant::now() + std::time::Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap(), None);

        // The registry still holds the socket for the next generation.
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_serve_without_listen_fails() {
        let registry = Arc::new(Registry::new());
        let server = StatusServer::new(Acquirer::new(registry), 1, "web", "tcp", "127.0.0.1:0");
        assert!(server.serve(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unix_socket_path_survives_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let registry = Arc::new(Registry::new());
        let server = StatusServer::new(
            Acquirer::new(registry),
            1,
            "ctl",
            "unix",
            path.to_str().unwrap(),
        );

        server.listen().await.unwrap();
        server.close().await.unwrap();
        assert!(path.exists());
    }
}
