//! Generation orchestrator.
//!
//! Sequences configuration loads, reloads and exits into generations of a
//! running server ensemble.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  reload / exit   ┌─────────────────┐
//! │OrchestratorHandle│─────────────────▶│     Reactor     │ builds generations,
//! │ (signals, admin) │  (mpsc queues)   │ (state owner)   │ cancels the old one
//! └──────────────────┘                  └────────┬────────┘
//!                                                │ new generation / exit mode
//!                                                ▼
//!                                       ┌─────────────────┐
//!                                       │   serve loop    │ serves the current
//!                                       │ (Orchestrator:: │ generation, drains
//!                                       │      run)       │ the retired ones
//!                                       └─────────────────┘
//! ```
//!
//! Process replacement and descriptor-store pushes are reactor requests
//! too: a build resets the registry until the new generation listens, so
//! they are only ever handled between builds.
//!
//! The reactor is the only writer of orchestrator state. The serve loop
//! blocks in `Ensemble::serve` for the current generation; once its token
//! is cancelled it either moves on to the generation the reactor swapped
//! in, or drains and returns.

use std::sync::Arc;
use std::time::Duration;

use gone_core::Registry;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

mod actor;
mod commands;
mod generation;
mod handle;

pub use commands::{
    ExitMode, ExitRequest, GenerationEvent, HandoffRequest, RegistryTask, ReloadRequest,
};
pub use generation::{Cleanup, Configure, Generation, GenerationContext, GenerationDefaults};
pub use handle::OrchestratorHandle;

use crate::ensemble::ReadyFn;
use crate::error::{BoxError, OrchestratorError};
use actor::Reactor;
use generation::BuildError;

/// Queue sizes. A single pending reload is enough since reloads coalesce.
const RELOAD_BUFFER: usize = 1;
const EXIT_BUFFER: usize = 4;
const HANDOFF_BUFFER: usize = 8;
const EVENT_BUFFER: usize = 64;

/// Callback run with the revision once a generation is serving.
pub type ReadyHook = Arc<dyn Fn(u64) -> Result<(), BoxError> + Send + Sync>;

/// What the serve loop does once the current generation stops serving.
enum Step {
    Swap(Arc<Generation>),
    Exit(ExitMode, Option<Arc<Generation>>),
}

/// Runs generations of a server ensemble until told to exit.
pub struct Orchestrator {
    registry: Arc<Registry>,
    configure: Arc<dyn Configure>,
    defaults: GenerationDefaults,
    on_ready: Option<ReadyHook>,

    handle: OrchestratorHandle,
    reload_rx: mpsc::Receiver<ReloadRequest>,
    exit_rx: mpsc::Receiver<ExitRequest>,
    exit_timeout_rx: mpsc::Receiver<Duration>,
    handoff_rx: mpsc::Receiver<HandoffRequest>,
    revision_tx: watch::Sender<u64>,
    events: broadcast::Sender<GenerationEvent>,
}

impl Orchestrator {
    /// Creates an orchestrator that builds generations with `configure`.
    pub fn new(registry: Arc<Registry>, configure: impl Configure) -> Self {
        let (reload_tx, reload_rx) = mpsc::channel(RELOAD_BUFFER);
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_BUFFER);
        let (exit_timeout_tx, exit_timeout_rx) = mpsc::channel(EXIT_BUFFER);
        let (handoff_tx, handoff_rx) = mpsc::channel(HANDOFF_BUFFER);
        let (revision_tx, revision_rx) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let handle = OrchestratorHandle::new(
            reload_tx,
            exit_tx,
            exit_timeout_tx,
            handoff_tx,
            revision_rx,
            events.clone(),
        );

        Self {
            registry,
            configure: Arc::new(configure),
            defaults: GenerationDefaults::default(),
            on_ready: None,
            handle,
            reload_rx,
            exit_rx,
            exit_timeout_rx,
            handoff_rx,
            revision_tx,
            events,
        }
    }

    /// Sets the drain timeout and reload mode generations start with.
    pub fn with_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Runs `hook` each time a generation has started all its servers.
    /// Its error is logged, never fatal.
    pub fn on_ready(
        mut self,
        hook: impl Fn(u64) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.on_ready = Some(Arc::new(hook));
        self
    }

    /// Returns a handle for steering the orchestrator. Requests made before
    /// [`run`](Self::run) are queued.
    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// Builds the first generation and serves until an exit completes.
    ///
    /// # Errors
    ///
    /// - `OrchestratorError::InitialConfigure` / `InitialListen` if the
    ///   first generation cannot be built; later failures only fail the
    ///   reload that caused them
    pub async fn run(self) -> Result<(), OrchestratorError> {
        let Self {
            registry,
            configure,
            defaults,
            on_ready,
            handle,
            reload_rx,
            exit_rx,
            exit_timeout_rx,
            handoff_rx,
            revision_tx,
            events,
        } = self;

        let first = generation::build(&registry, &*configure, 1, &defaults)
            .await
            .map_err(|e| match e {
                BuildError::Configure(e) => OrchestratorError::InitialConfigure(e),
                BuildError::Listen(e) => OrchestratorError::InitialListen(e),
            })?;
        let first = Arc::new(first);
        revision_tx.send_replace(1);
        let _ = events.send(GenerationEvent::Configured { revision: 1 });

        let (generation_tx, mut generation_rx) = mpsc::unbounded_channel();
        let (exit_mode_tx, mut exit_mode_rx) = watch::channel(None);
        let teardown = CancellationToken::new();

        let reactor = Reactor {
            registry,
            configure,
            defaults,
            current: Arc::clone(&first),
            exit_mode: None,
            reload_rx,
            exit_rx,
            exit_timeout_rx,
            handoff_rx,
            teardown: teardown.clone(),
            generation_tx,
            exit_mode_tx,
            revision_tx,
            events: events.clone(),
        };
        let reactor_task = tokio::spawn(reactor.run());

        let retiring = TaskTracker::new();
        let mut current = first;

        loop {
            let ready = ready_fn(on_ready.as_ref(), current.revision);
            if let Err(e) = current.ensemble.serve(current.token.clone(), ready).await {
                error!(revision = current.revision, error = %e, "Generation stopped with error");
            }

            let mut asked_exit = false;
            let step = loop {
                let mut latest: Option<Arc<Generation>> = None;
                while let Ok(next) = generation_rx.try_recv() {
                    if let Some(skipped) = latest.replace(next) {
                        // Superseded before it ever served.
                        retiring.spawn(generation::drain(
                            skipped,
                            ExitMode::GRACEFUL,
                            exit_mode_rx.clone(),
                            events.clone(),
                        ));
                    }
                }

                let exit = *exit_mode_rx.borrow_and_update();
                match (latest, exit) {
                    (latest, Some(mode)) => break Step::Exit(mode, latest),
                    (Some(next), None) => break Step::Swap(next),
                    (None, None) => {
                        if !asked_exit {
                            warn!(
                                revision = current.revision,
                                "All servers stopped on their own, exiting"
                            );
                            asked_exit = true;
                            if handle.exit(true).await.is_err() {
                                break Step::Exit(ExitMode::GRACEFUL, None);
                            }
                        }
                        if exit_mode_rx.changed().await.is_err() {
                            break Step::Exit(ExitMode::GRACEFUL, None);
                        }
                    }
                }
            };

            match step {
                Step::Swap(next) => {
                    let previous = std::mem::replace(&mut current, next);
                    info!(
                        from = previous.revision,
                        to = current.revision,
                        "Switching generations"
                    );
                    let retire = generation::drain(
                        previous,
                        ExitMode::GRACEFUL,
                        exit_mode_rx.clone(),
                        events.clone(),
                    );
                    if current.sync_reload {
                        retire.await;
                    } else {
                        retiring.spawn(retire);
                    }
                }
                Step::Exit(mode, unserved) => {
                    if let Some(unserved) = unserved {
                        retiring.spawn(generation::drain(
                            unserved,
                            mode,
                            exit_mode_rx.clone(),
                            events.clone(),
                        ));
                    }
                    generation::drain(current, mode, exit_mode_rx.clone(), events.clone()).await;
                    break;
                }
            }
        }

        retiring.close();
        retiring.wait().await;
        teardown.cancel();
        if let Err(e) = reactor_task.await {
            error!(error = %e, "Reactor task failed");
        }

        info!("Orchestrator stopped");
        Ok(())
    }
}

fn ready_fn(hook: Option<&ReadyHook>, revision: u64) -> Option<ReadyFn> {
    let hook = Arc::clone(hook?);
    Some(Box::new(move || hook(revision)))
}
