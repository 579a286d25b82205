//! Server ensemble: the managed servers of one generation.
//!
//! ```text
//!   Unconfigured ──listen()──▶ Listening ──serve()──▶ Serving
//!                                                        │
//!                             Done ◀── shutdown()/close() ┘ (Draining)
//! ```
//!
//! Managed servers expose optional capabilities through accessor methods on
//! [`ManagedServer`]; a server that returns `None` from
//! [`as_shutdown`](ManagedServer::as_shutdown) is simply skipped when the
//! ensemble drains.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, EnsembleError};

/// A long-running server managed by the orchestrator.
#[async_trait]
pub trait ManagedServer: Send + Sync {
    /// Serves until `cancel` fires or the server fails.
    async fn serve(&self, cancel: CancellationToken) -> Result<(), BoxError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Pre-serve preparation capability.
    fn as_listen(&self) -> Option<&dyn Listen> {
        None
    }

    /// Graceful and forced stop capability.
    fn as_shutdown(&self) -> Option<&dyn Shutdown> {
        None
    }

    /// Background-work capability.
    fn as_wait(&self) -> Option<&dyn Wait> {
        None
    }
}

/// Opens whatever the server needs before serving (usually its listener).
#[async_trait]
pub trait Listen: Send + Sync {
    async fn listen(&self) -> Result<(), BoxError>;
}

/// Stops a server.
#[async_trait]
pub trait Shutdown: Send + Sync {
    /// Stops accepting work and lets in-flight work finish, giving up at
    /// `deadline` if one is set.
    async fn shutdown(&self, deadline: Option<Instant>) -> Result<(), BoxError>;

    /// Aborts everything immediately.
    async fn close(&self) -> Result<(), BoxError>;
}

/// Reports background activity that outlives `serve`.
#[async_trait]
pub trait Wait: Send + Sync {
    /// Resolves once the server has no more in-flight work.
    async fn wait(&self);
}

/// Callback run once every member has been started.
pub type ReadyFn = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;

/// Lifecycle state of an ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleState {
    Unconfigured,
    Listening,
    Serving,
    Draining,
    Done,
}

impl EnsembleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Listening => "listening",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for EnsembleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered set of managed servers.
pub struct Ensemble {
    servers: Vec<Arc<dyn ManagedServer>>,
    state: Mutex<EnsembleState>,
    waiters: TaskTracker,
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ensemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ensemble")
            .field("servers", &self.descriptions())
            .field("state", &self.state())
            .finish()
    }
}

impl Ensemble {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            state: Mutex::new(EnsembleState::Unconfigured),
            waiters: TaskTracker::new(),
        }
    }

    /// Appends a server. Later servers may depend on earlier ones and are
    /// stopped first.
    pub fn push(&mut self, server: impl ManagedServer + 'static) {
        self.servers.push(Arc::new(server));
    }

    /// Appends a shared server.
    pub fn push_arc(&mut self, server: Arc<dyn ManagedServer>) {
        self.servers.push(server);
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, server: impl ManagedServer + 'static) -> Self {
        self.push(server);
        self
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.describe()).collect()
    }

    pub fn state(&self) -> EnsembleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EnsembleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves from `from` to `to`, failing if the ensemble is elsewhere.
    fn transition(
        &self,
        op: &'static str,
        from: EnsembleState,
        to: EnsembleState,
    ) -> Result<(), EnsembleError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(EnsembleError::InvalidState {
                op,
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Runs every member's listen step in registration order.
    ///
    /// Stops at the first failure. Listeners opened by earlier members are
    /// left open; dispose of the ensemble with [`close`](Self::close) to
    /// release them.
    pub async fn listen(&self) -> Result<(), EnsembleError> {
        self.transition("listen", EnsembleState::Unconfigured, EnsembleState::Listening)?;
        for server in &self.servers {
            if let Some(listener) = server.as_listen() {
                if let Err(source) = listener.listen().await {
                    return Err(EnsembleError::Listen {
                        server: server.describe(),
                        source,
                    });
                }
                debug!(server = %server.describe(), "Listening");
            }
        }
        Ok(())
    }

    /// Serves every member concurrently until all of them return.
    ///
    /// `ready` runs once every member has been started; its error is only
    /// logged. Returns the first member failure, if any. Members with a
    /// wait capability are waited on in the background; see
    /// [`wait`](Self::wait).
    pub async fn serve(
        &self,
        cancel: CancellationToken,
        ready: Option<ReadyFn>,
    ) -> Result<(), EnsembleError> {
        self.transition("serve", EnsembleState::Listening, EnsembleState::Serving)?;

        let mut workers = JoinSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            let server = Arc::clone(server);
            let cancel = cancel.clone();
            let waiters = self.waiters.clone();
            workers.spawn(async move {
                let result = server.serve(cancel).await;
                if server.as_wait().is_some() {
                    let server = Arc::clone(&server);
                    waiters.spawn(async move {
                        if let Some(waiter) = server.as_wait() {
                            waiter.wait().await;
                        }
                        debug!(server = %server.describe(), "Server quiesced");
                    });
                }
                (index, result)
            });
        }

        if let Some(ready) = ready {
            if let Err(e) = ready() {
                warn!(error = %e, "Readiness callback failed");
            }
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((index, Err(source))) => Some(EnsembleError::Serve {
                    server: self.describe_at(index),
                    source,
                }),
                Err(e) => Some(EnsembleError::Serve {
                    server: "worker".to_string(),
                    source: Box::new(e),
                }),
            };
            if let Some(failure) = failure {
                error!(error = %failure, "Server stopped with error");
                first_error.get_or_insert(failure);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn describe_at(&self, index: usize) -> String {
        self.servers
            .get(index)
            .map(|s| s.describe())
            .unwrap_or_else(|| format!("server #{index}"))
    }

    /// Resolves once every member's background work has finished.
    pub async fn wait(&self) {
        self.waiters.close();
        self.waiters.wait().await;
    }

    /// Gracefully stops every member, last registered first.
    ///
    /// The stops run concurrently; all of them are awaited and the first
    /// failure is returned.
    pub async fn shutdown(&self, deadline: Option<Instant>) -> Result<(), EnsembleError> {
        self.set_state(EnsembleState::Draining);
        let result = self
            .each_reversed("shutdown", move |server| async move {
                match server.as_shutdown() {
                    Some(stopper) => stopper.shutdown(deadline).await,
                    None => Ok(()),
                }
            })
            .await;
        if result.is_ok() {
            self.set_state(EnsembleState::Done);
        }
        result
    }

    /// Forcibly stops every member, last registered first.
    pub async fn close(&self) -> Result<(), EnsembleError> {
        self.set_state(EnsembleState::Draining);
        let result = self
            .each_reversed("close", |server| async move {
                match server.as_shutdown() {
                    Some(stopper) => stopper.close().await,
                    None => Ok(()),
                }
            })
            .await;
        self.set_state(EnsembleState::Done);
        result
    }

    async fn each_reversed<F, Fut>(&self, op: &'static str, call: F) -> Result<(), EnsembleError>
    where
        F: Fn(Arc<dyn ManagedServer>) -> Fut,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for (index, server) in self.servers.iter().enumerate().rev() {
            tasks.spawn({
                let fut = call(Arc::clone(server));
                async move { (index, fut.await) }
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(op, error = %e, "Stop task failed");
                    continue;
                }
            };
            if let Err(source) = result {
                let server = self.describe_at(index);
                warn!(op, server = %server, error = %source, "Server stop failed");
                let err = match op {
                    "shutdown" => EnsembleError::Shutdown { server, source },
                    _ => EnsembleError::Close { server, source },
                };
                first_error.get_or_insert(err);
            }
        }

        info!(op, servers = self.servers.len(), "Ensemble stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
