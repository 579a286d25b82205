//! One configuration epoch: building it, and draining it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use gone_core::Registry;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::commands::{ExitMode, GenerationEvent};
use crate::ensemble::Ensemble;
use crate::error::{BoxError, EnsembleError};
use crate::listener::{Acquirer, Journal};

/// Callback run after a generation has fully stopped.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Builds the server ensemble for a new generation.
///
/// Called once at startup and again for every reload, always from the
/// orchestrator's reactor, so calls never overlap. Listeners must be
/// acquired through [`GenerationContext::acquirer`] so a failed build can
/// be rolled back.
#[async_trait]
pub trait Configure: Send + Sync + 'static {
    async fn configure(&self, ctx: &mut GenerationContext) -> Result<Ensemble, BoxError>;
}

#[async_trait]
impl<F> Configure for F
where
    F: Fn(&mut GenerationContext) -> Result<Ensemble, BoxError> + Send + Sync + 'static,
{
    async fn configure(&self, ctx: &mut GenerationContext) -> Result<Ensemble, BoxError> {
        self(ctx)
    }
}

/// What a configuration function gets to work with.
pub struct GenerationContext {
    revision: u64,
    acquirer: Acquirer,
    cleanups: Vec<Cleanup>,
    drain_timeout: Option<Duration>,
    sync_reload: bool,
}

impl fmt::Debug for GenerationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationContext")
            .field("revision", &self.revision)
            .field("cleanups", &self.cleanups.len())
            .field("drain_timeout", &self.drain_timeout)
            .field("sync_reload", &self.sync_reload)
            .finish()
    }
}

impl GenerationContext {
    pub(crate) fn new(revision: u64, acquirer: Acquirer, defaults: &GenerationDefaults) -> Self {
        Self {
            revision,
            acquirer,
            cleanups: Vec::new(),
            drain_timeout: defaults.drain_timeout,
            sync_reload: defaults.sync_reload,
        }
    }

    /// Revision of the generation being built (the first is 1).
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Listener acquisition bound to this generation.
    pub fn acquirer(&self) -> &Acquirer {
        &self.acquirer
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.acquirer.registry()
    }

    /// Registers `cleanup` to run once this generation has fully stopped,
    /// or right away if the build fails.
    pub fn on_cleanup(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Bounds how long this generation may take to drain.
    pub fn set_drain_timeout(&mut self, timeout: Option<Duration>) {
        self.drain_timeout = timeout;
    }

    /// When true, this generation waits for its predecessor to finish
    /// draining and run its cleanups before it starts serving.
    pub fn set_sync_reload(&mut self, sync: bool) {
        self.sync_reload = sync;
    }
}

/// Settings each generation starts from.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationDefaults {
    pub drain_timeout: Option<Duration>,
    pub sync_reload: bool,
}

/// A built, listening generation.
pub struct Generation {
    pub(crate) revision: u64,
    pub(crate) ensemble: Ensemble,
    pub(crate) token: CancellationToken,
    cleanups: Mutex<Vec<Cleanup>>,
    pub(crate) drain_timeout: Option<Duration>,
    pub(crate) sync_reload: bool,
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("revision", &self.revision)
            .field("ensemble", &self.ensemble)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl Generation {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn run_cleanups(&self) {
        let cleanups = std::mem::take(
            &mut *self
                .cleanups
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = cleanups.len();
        for cleanup in cleanups {
            cleanup();
        }
        if count > 0 {
            debug!(revision = self.revision, count, "Ran generation cleanups");
        }
    }
}

/// Why a generation could not be built.
#[derive(Debug)]
pub(crate) enum BuildError {
    Configure(BoxError),
    Listen(EnsembleError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configure(e) => write!(f, "configure: {e}"),
            Self::Listen(e) => write!(f, "listen: {e}"),
        }
    }
}

/// Builds generation `revision`.
///
/// The registry is reset first so the new configuration can reclaim the
/// sockets the running generation exported. On success the sockets nobody
/// reclaimed are closed; on failure the fresh sockets are forgotten and the
/// running generation's entries are made active again.
pub(crate) async fn build(
    registry: &Arc<Registry>,
    configure: &dyn Configure,
    revision: u64,
    defaults: &GenerationDefaults,
) -> Result<Generation, BuildError> {
    let journal = Journal::default();
    let acquirer = Acquirer::new(Arc::clone(registry)).with_journal(journal.clone());
    let mut ctx = GenerationContext::new(revision, acquirer, defaults);

    registry.reset();

    let ensemble = match configure.configure(&mut ctx).await {
        Ok(ensemble) => ensemble,
        Err(e) => {
            roll_back(registry, &journal, ctx.cleanups);
            return Err(BuildError::Configure(e));
        }
    };

    if let Err(e) = ensemble.listen().await {
        if let Err(close_err) = ensemble.close().await {
            warn!(revision, error = %close_err, "Closing half-built generation failed");
        }
        roll_back(registry, &journal, ctx.cleanups);
        return Err(BuildError::Listen(e));
    }

    let closed = registry.cleanup();
    info!(
        revision,
        servers = ensemble.len(),
        closed_unclaimed = closed,
        "Generation configured"
    );

    Ok(Generation {
        revision,
        ensemble,
        token: CancellationToken::new(),
        cleanups: Mutex::new(ctx.cleanups),
        drain_timeout: ctx.drain_timeout,
        sync_reload: ctx.sync_reload,
    })
}

fn roll_back(registry: &Registry, journal: &Journal, cleanups: Vec<Cleanup>) {
    for token in journal.fresh_tokens() {
        if let Err(e) = registry.forget(token) {
            debug!(%token, error = %e, "Fresh export already gone");
        }
    }
    let restored = registry.reactivate();
    debug!(restored = restored.len(), "Rolled back registry");
    for cleanup in cleanups {
        cleanup();
    }
}

/// Stops `generation` and runs its cleanups.
///
/// A graceful drain is bounded by the exit timeout, else the generation's
/// own drain timeout, and becomes a forced close on expiry or failure.
/// Exit requests arriving through `exit_mode` while it drains still apply:
/// a forced exit closes at once and a shorter timeout pulls the deadline in.
pub(crate) async fn drain(
    generation: Arc<Generation>,
    mode: ExitMode,
    mut exit_mode: watch::Receiver<Option<ExitMode>>,
    events: broadcast::Sender<GenerationEvent>,
) {
    let revision = generation.revision;
    generation.token.cancel();

    let mut needs_close = !mode.graceful;
    if mode.graceful {
        let timeout = mode.timeout.or(generation.drain_timeout);
        let mut deadline = timeout.map(|t| Instant::now() + t);
        info!(
            revision,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Draining generation"
        );

        let first_deadline = deadline;
        let graceful = async {
            generation.ensemble.shutdown(first_deadline).await?;
            generation.ensemble.wait().await;
            Ok::<(), EnsembleError>(())
        };
        tokio::pin!(graceful);

        let mut forced = tighten(*exit_mode.borrow_and_update(), &mut deadline);
        let mut watching = true;
        let outcome = loop {
            if forced {
                info!(revision, "Forced exit requested during drain");
                break Err(EnsembleError::DeadlineExceeded);
            }
            let expiry_at = deadline;
            let expiry = async move {
                match expiry_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                result = &mut graceful => break result,
                _ = expiry => break Err(EnsembleError::DeadlineExceeded),
                changed = exit_mode.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else {
                        forced = tighten(*exit_mode.borrow_and_update(), &mut deadline);
                    }
                }
            }
        };
        if let Err(e) = outcome {
            warn!(revision, error = %e, "Graceful drain incomplete, closing");
            needs_close = true;
        }
    }

    if needs_close {
        if let Err(e) = generation.ensemble.close().await {
            error!(revision, critical = true, error = %e, "Forced close failed");
        }
    }

    generation.run_cleanups();
    info!(revision, "Generation retired");
    let _ = events.send(GenerationEvent::Retired { revision });
}

/// Applies an exit request to a drain in progress. Returns true if the
/// drain must stop waiting and close.
fn tighten(requested: Option<ExitMode>, deadline: &mut Option<Instant>) -> bool {
    let Some(requested) = requested else {
        return false;
    };
    if !requested.graceful {
        return true;
    }
    if let Some(timeout) = requested.timeout {
        let limit = Instant::now() + timeout;
        if deadline.map_or(true, |current| limit < current) {
            debug!(timeout_ms = timeout.as_millis() as u64, "Drain deadline tightened");
            *deadline = Some(limit);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_failed_build_restores_previous_exports() {
        let registry = Arc::new(Registry::new());
        let kept = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.export("kept", &kept).unwrap();

        let cleaned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleaned);
        let configure = move |ctx: &mut GenerationContext| -> Result<Ensemble, BoxError> {
            ctx.acquirer().acquire("extra", "tcp", "127.0.0.1:0")?;
            let counter = Arc::clone(&counter);
            ctx.on_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            Err("bad config".into())
        };

        let err = build(&registry, &configure, 2, &GenerationDefaults::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Configure(_)));

        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.available_count(), 0);
        assert_eq!(registry.entries()[0].name, "kept");
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_build_closes_unclaimed() {
        let registry = Arc::new(Registry::new());
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        let a_addr = a.local_addr().unwrap().to_string();
        registry.export("a", &a).unwrap();
        registry.export("b", &b).unwrap();

        let configure = move |ctx: &mut GenerationContext| -> Result<Ensemble, BoxError> {
            let acquired = ctx.acquirer().acquire("a", "tcp", &a_addr)?;
            assert!(acquired.inherited);
            Ok(Ensemble::new())
        };

        let generation = build(&registry, &configure, 2, &GenerationDefaults::default())
            .await
            .unwrap();
        assert_eq!(generation.revision(), 2);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.available_count(), 0);
    }
}
