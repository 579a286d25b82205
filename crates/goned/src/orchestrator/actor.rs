//! The reactor: sole owner of orchestrator state.
//!
//! Reload, exit and handoff requests arrive on bounded queues and are
//! applied one at a time, so a reload racing an exit from two signal
//! handlers always resolves in a single, total order. Exits are looked at
//! first, then handoffs, then reloads. A handoff never observes the
//! registry halfway through a build.

use std::sync::Arc;
use std::time::Duration;

use gone_core::Registry;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::commands::{ExitMode, ExitRequest, GenerationEvent, HandoffRequest, ReloadRequest};
use super::generation::{self, Configure, Generation, GenerationDefaults};
use crate::error::OrchestratorError;
use crate::replace::replace_process;

/// Reactor half of the orchestrator.
pub(crate) struct Reactor {
    pub(crate) registry: Arc<Registry>,
    pub(crate) configure: Arc<dyn Configure>,
    pub(crate) defaults: GenerationDefaults,
    pub(crate) current: Arc<Generation>,
    pub(crate) exit_mode: Option<ExitMode>,

    pub(crate) reload_rx: mpsc::Receiver<ReloadRequest>,
    pub(crate) exit_rx: mpsc::Receiver<ExitRequest>,
    pub(crate) exit_timeout_rx: mpsc::Receiver<Duration>,
    pub(crate) handoff_rx: mpsc::Receiver<HandoffRequest>,
    pub(crate) teardown: CancellationToken,

    /// Every generation swapped in, in order, for the serve loop.
    pub(crate) generation_tx: mpsc::UnboundedSender<Arc<Generation>>,
    pub(crate) exit_mode_tx: watch::Sender<Option<ExitMode>>,
    pub(crate) revision_tx: watch::Sender<u64>,
    pub(crate) events: broadcast::Sender<GenerationEvent>,
}

impl Reactor {
    /// Runs until the serve loop tears the orchestrator down.
    pub(crate) async fn run(mut self) {
        info!(revision = self.current.revision, "Orchestrator reactor starting");

        loop {
            tokio::select! {
                biased;

                _ = self.teardown.cancelled() => break,

                Some(request) = self.exit_rx.recv() => {
                    self.handle_exit(ExitMode {
                        graceful: request.graceful,
                        timeout: None,
                    });
                }

                Some(timeout) = self.exit_timeout_rx.recv() => {
                    self.handle_exit(ExitMode {
                        graceful: true,
                        timeout: Some(timeout),
                    });
                }

                Some(request) = self.handoff_rx.recv() => self.handle_handoff(request),

                Some(request) = self.reload_rx.recv() => {
                    let result = self.handle_reload().await;
                    if let Some(respond_to) = request.respond_to {
                        // Ignore send error - caller may have stopped waiting
                        let _ = respond_to.send(result);
                    }
                }
            }
        }

        // Anything still queued is answered rather than left hanging.
        self.reload_rx.close();
        while let Ok(request) = self.reload_rx.try_recv() {
            if let Some(respond_to) = request.respond_to {
                let _ = respond_to.send(Err(OrchestratorError::Exiting));
            }
        }
        self.handoff_rx.close();
        while let Ok(request) = self.handoff_rx.try_recv() {
            if let HandoffRequest::Replace {
                respond_to: Some(respond_to),
                ..
            } = request
            {
                let _ = respond_to.send(Err(OrchestratorError::Exiting));
            }
        }

        info!(revision = self.current.revision, "Orchestrator reactor stopped");
    }

    async fn handle_reload(&mut self) -> Result<u64, OrchestratorError> {
        if self.exit_mode.is_some() {
            warn!("Ignoring reload: orchestrator is exiting");
            return Err(OrchestratorError::Exiting);
        }

        let current = self.current.revision;
        let revision = current + 1;
        info!(revision, "Reloading");

        match generation::build(&self.registry, &*self.configure, revision, &self.defaults).await
        {
            Ok(next) => {
                let next = Arc::new(next);
                let previous = std::mem::replace(&mut self.current, Arc::clone(&next));
                if self.generation_tx.send(next).is_err() {
                    // The serve loop is gone; nobody will ever serve it.
                    warn!(revision, "Serve loop stopped during reload");
                }
                self.revision_tx.send_replace(revision);
                previous.token.cancel();
                let _ = self.events.send(GenerationEvent::Configured { revision });
                Ok(revision)
            }
            Err(e) => {
                error!(
                    revision,
                    current,
                    error = %e,
                    "Reload failed, previous generation keeps serving"
                );
                let _ = self.events.send(GenerationEvent::ReloadFailed {
                    current,
                    error: e.to_string(),
                });
                Err(OrchestratorError::ReloadFailed(e.to_string()))
            }
        }
    }

    fn handle_handoff(&self, request: HandoffRequest) {
        match request {
            HandoffRequest::Replace { signal, respond_to } => {
                let result: Result<u32, OrchestratorError> =
                    replace_process(&self.registry, signal).map_err(Into::into);
                match &result {
                    Ok(pid) => info!(
                        revision = self.current.revision,
                        child = pid,
                        "Replacement process started"
                    ),
                    Err(e) => error!(error = %e, "Process replacement failed"),
                }
                if let Some(respond_to) = respond_to {
                    // Ignore send error - caller may have stopped waiting
                    let _ = respond_to.send(result);
                }
            }
            HandoffRequest::Inspect(task) => task(&self.registry),
        }
    }

    fn handle_exit(&mut self, requested: ExitMode) {
        let mode = match self.exit_mode {
            Some(existing) => existing.merge(requested),
            None => requested,
        };
        if self.exit_mode == Some(mode) {
            return;
        }
        self.exit_mode = Some(mode);

        info!(
            revision = self.current.revision,
            graceful = mode.graceful,
            timeout_ms = mode.timeout.map(|t| t.as_millis() as u64),
            "Exit requested"
        );
        self.exit_mode_tx.send_replace(Some(mode));
        self.current.token.cancel();
        let _ = self.events.send(GenerationEvent::Exiting {
            graceful: mode.graceful,
        });
    }
}
