//! Client interface for the orchestrator reactor.
//!
//! Requests are only ever delivered as messages; nothing outside the
//! reactor touches generation state.

use std::time::Duration;

use gone_core::Registry;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::warn;

use super::commands::{ExitRequest, GenerationEvent, HandoffRequest, ReloadRequest};
use crate::error::OrchestratorError;

/// Cheap-to-clone handle for steering a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    reload_tx: mpsc::Sender<ReloadRequest>,
    exit_tx: mpsc::Sender<ExitRequest>,
    exit_timeout_tx: mpsc::Sender<Duration>,
    handoff_tx: mpsc::Sender<HandoffRequest>,
    revision: watch::Receiver<u64>,
    events: broadcast::Sender<GenerationEvent>,
}

impl OrchestratorHandle {
    pub(crate) fn new(
        reload_tx: mpsc::Sender<ReloadRequest>,
        exit_tx: mpsc::Sender<ExitRequest>,
        exit_timeout_tx: mpsc::Sender<Duration>,
        handoff_tx: mpsc::Sender<HandoffRequest>,
        revision: watch::Receiver<u64>,
        events: broadcast::Sender<GenerationEvent>,
    ) -> Self {
        Self {
            reload_tx,
            exit_tx,
            exit_timeout_tx,
            handoff_tx,
            revision,
            events,
        }
    }

    /// Queues a reload without waiting for it.
    ///
    /// A request made while another is still queued is folded into it.
    /// Returns false if the orchestrator has stopped.
    pub fn request_reload(&self) -> bool {
        match self.reload_tx.try_send(ReloadRequest { respond_to: None }) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Reloads and waits for the outcome.
    ///
    /// # Errors
    ///
    /// - `OrchestratorError::ReloadFailed` if the new generation could not
    ///   be built; the previous one keeps serving
    /// - `OrchestratorError::Exiting` if the orchestrator is shutting down
    /// - `OrchestratorError::ChannelClosed` if it has stopped
    pub async fn reload(&self) -> Result<u64, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.reload_tx
            .send(ReloadRequest {
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)?
    }

    /// Stops the orchestrator, draining gracefully or closing immediately.
    ///
    /// A forced exit escalates a graceful one already in progress.
    pub async fn exit(&self, graceful: bool) -> Result<(), OrchestratorError> {
        self.exit_tx
            .send(ExitRequest { graceful })
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)
    }

    /// Stops the orchestrator gracefully, forcing a close after `timeout`.
    pub async fn exit_with_timeout(&self, timeout: Duration) -> Result<(), OrchestratorError> {
        self.exit_timeout_tx
            .send(timeout)
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)
    }

    /// Starts a replacement process holding every active descriptor and
    /// returns its PID. `signal` is what it sends back once serving.
    ///
    /// Never runs while a reload is building, so the replacement always
    /// gets the serving generation's full set of listeners.
    pub async fn replace_process(&self, signal: i32) -> Result<u32, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.handoff_tx
            .send(HandoffRequest::Replace {
                signal,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)?
    }

    /// Queues a process replacement without waiting for it. The outcome is
    /// logged. Returns false if the request could not be queued.
    pub fn request_replace(&self, signal: i32) -> bool {
        self.queue_handoff(HandoffRequest::Replace {
            signal,
            respond_to: None,
        })
    }

    /// Queues `task` to run against the registry between generation
    /// builds. Returns false if the request could not be queued.
    pub fn with_registry(&self, task: impl FnOnce(&Registry) + Send + 'static) -> bool {
        self.queue_handoff(HandoffRequest::Inspect(Box::new(task)))
    }

    fn queue_handoff(&self, request: HandoffRequest) -> bool {
        match self.handoff_tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                warn!(?request, "Handoff queue full, dropping request");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Revision of the generation currently taking requests (0 before the
    /// first one is up).
    pub fn current_revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Subscribes to generation lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.events.subscribe()
    }
}
