//! The `goned` daemon: configuration-driven generations, signal wiring,
//! supervisor notifications and the PID file.
//!
//! # Signal Handling
//!
//! - SIGHUP: reload the configuration into a new generation
//! - SIGTERM/SIGINT: graceful exit
//! - SIGQUIT: forced exit
//! - SIGUSR2: start a replacement process and hand it the listeners

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use gone_core::Registry;
use gone_notify::{Notifier, NotifyMessage, NotifyState, StatusKind};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::ensemble::Ensemble;
use crate::error::BoxError;
use crate::orchestrator::{
    Configure, GenerationContext, GenerationEvent, Orchestrator, OrchestratorHandle,
};
use crate::replace::{signal_parent_termination, ParentHandshake};
use crate::status::StatusServer;

/// Environment variable overriding the PID file location.
pub const PID_FILE_ENV: &str = "GONED_PID_FILE";

/// Builds each generation from the configuration file, re-read every time.
///
/// One [`StatusServer`] is created per configured listener.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    fdstore: Arc<AtomicBool>,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fdstore: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flag tracking the `fdstore` setting of the last loaded configuration.
    pub fn fdstore_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fdstore)
    }
}

#[async_trait]
impl Configure for ConfigFile {
    async fn configure(&self, ctx: &mut GenerationContext) -> Result<Ensemble, BoxError> {
        let config = DaemonConfig::load(&self.path)?;

        ctx.set_drain_timeout(config.drain_timeout());
        ctx.set_sync_reload(config.sync_reload);
        let acquirer = ctx
            .acquirer()
            .clone()
            .with_unlink_policy(config.unlink_policy()?)
            .with_inherit_only(config.inherit_only);

        let mut ensemble = Ensemble::new();
        for listener in &config.listeners {
            ensemble.push(StatusServer::new(
                acquirer.clone(),
                ctx.revision(),
                &listener.name,
                &listener.network,
                &listener.address,
            ));
        }

        // Read by the ready hook once this generation serves.
        self.fdstore.store(config.fdstore, Ordering::SeqCst);

        Ok(ensemble)
    }
}

/// PID file of a running daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `GONED_PID_FILE`, else `<state_dir>/gone/goned.pid`.
    pub fn from_env_or_default() -> Self {
        if let Some(path) = std::env::var_os(PID_FILE_ENV).filter(|p| !p.is_empty()) {
            return Self::new(path);
        }
        let state_dir = dirs::state_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("gone");
        Self::new(state_dir.join("goned.pid"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded PID, if any.
    pub fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    /// Records the current PID.
    ///
    /// Written to a temporary file and renamed into place, since a
    /// replacement process overwrites the file while its parent still runs.
    pub fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}", process::id()));
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp)?;
            writeln!(file, "{}", process::id())?;
        }
        fs::rename(&tmp, &self.path)
    }

    /// Removes the file if it still names this process.
    pub fn remove_if_owned(&self) -> bool {
        if self.read() != Some(process::id()) {
            return false;
        }
        fs::remove_file(&self.path).is_ok()
    }

    /// Returns the recorded PID if that process is alive.
    pub fn running(&self) -> Option<u32> {
        self.read().filter(|&pid| is_process_running(pid))
    }
}

/// Checks if a process with the given PID exists.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Runs the daemon until an exit completes.
#[derive(Debug)]
pub struct Daemon {
    config_path: PathBuf,
    pid_file: PidFile,
    registry: Arc<Registry>,
    parent: Option<ParentHandshake>,
}

impl Daemon {
    /// `registry` holds the inherited descriptors. Build it with
    /// [`Registry::inherit`] in `main`, before the runtime starts threads.
    pub fn new(config_path: impl Into<PathBuf>, pid_file: PidFile, registry: Registry) -> Self {
        Self {
            config_path: config_path.into(),
            pid_file,
            registry: Arc::new(registry),
            parent: None,
        }
    }

    /// Signals the process being replaced once the first generation serves.
    pub fn with_parent(mut self, parent: Option<ParentHandshake>) -> Self {
        self.parent = parent;
        self
    }

    /// Adopts inherited sockets, serves generations and handles signals.
    ///
    /// # Errors
    ///
    /// Fails if the first generation cannot be built or signal handlers
    /// cannot be installed. Reload failures are logged and survived.
    pub async fn run(self) -> Result<(), BoxError> {
        let registry = Arc::clone(&self.registry);
        if let Some(e) = registry.inherit_error() {
            warn!(error = %e, "Ignoring malformed inheritance environment");
        }
        info!(
            inherited = registry.available_count(),
            names = ?registry.available_names(),
            "Adopted inherited descriptors"
        );

        let notifier = supervisor_notifier();
        let configure = ConfigFile::new(&self.config_path);
        let fdstore = configure.fdstore_flag();

        let orchestrator = Orchestrator::new(Arc::clone(&registry), configure);
        let handle = orchestrator.handle();
        let orchestrator = orchestrator.on_ready(ready_hook(
            handle.clone(),
            notifier.clone(),
            fdstore,
            self.pid_file.clone(),
            self.parent,
        ));
        let cancel = CancellationToken::new();

        let signals = spawn_signal_handler(handle.clone(), notifier.clone(), cancel.clone())?;
        let events = spawn_event_notifier(handle.subscribe(), notifier.clone(), cancel.clone());
        let watchdog = match (&notifier, gone_notify::watchdog()) {
            (Some(n), Some(w)) => Some(gone_notify::spawn_watchdog(
                n.clone(),
                w.timeout,
                cancel.clone(),
            )),
            _ => None,
        };

        let result = orchestrator.run().await;

        cancel.cancel();
        for task in [Some(signals), Some(events), watchdog].into_iter().flatten() {
            if let Err(e) = task.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }
        if self.pid_file.remove_if_owned() {
            debug!(path = %self.pid_file.path().display(), "Removed PID file");
        }

        result.map_err(Into::into)
    }
}

fn supervisor_notifier() -> Option<Notifier> {
    match Notifier::from_env() {
        Ok(notifier) => {
            info!(addr = ?notifier.addr(), "Supervisor notifications enabled");
            Some(notifier)
        }
        Err(e) if e.is_no_socket() => None,
        Err(e) => {
            warn!(error = %e, "Ignoring unusable NOTIFY_SOCKET");
            None
        }
    }
}

/// Readiness: PID file, `READY=1` with our PID and status, then the
/// parent-termination handshake on the first call.
///
/// With the descriptor store enabled the notification carries the active
/// descriptors, so it is sent from the reactor where a concurrent reload
/// cannot be halfway through resetting the registry.
fn ready_hook(
    handle: OrchestratorHandle,
    notifier: Option<Notifier>,
    fdstore: Arc<AtomicBool>,
    pid_file: PidFile,
    parent: Option<ParentHandshake>,
) -> impl Fn(u64) -> Result<(), BoxError> + Send + Sync + 'static {
    let parent = Mutex::new(parent);
    move |revision| {
        let mut result: Result<(), BoxError> = pid_file.write().map_err(|e| {
            format!("writing PID file {}: {e}", pid_file.path().display()).into()
        });

        if let Some(notifier) = &notifier {
            let message = NotifyMessage::new()
                .with(NotifyState::Ready)
                .with(NotifyState::MainPid(process::id()))
                .with(NotifyState::Status(format!("serving revision {revision}")));
            if fdstore.load(Ordering::SeqCst) {
                let notifier = notifier.clone();
                let queued = handle.with_registry(move |registry| {
                    match notifier.notify_with_fds(&message, registry) {
                        Ok(sent) => debug!(revision, datagrams = sent, "Pushed descriptor store"),
                        Err(e) => warn!(revision, error = %e, "Descriptor store push failed"),
                    }
                });
                if !queued {
                    result = result.and(Err("descriptor store push was not queued".into()));
                }
            } else if let Err(e) = notifier.notify(&message) {
                result = result.and(Err(e.into()));
            }
        }

        let parent = parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(parent) = parent {
            match signal_parent_termination(parent) {
                Ok(()) => info!(revision, parent = parent.pid, "Took over from parent process"),
                Err(e) => warn!(error = %e, "Parent termination handshake failed"),
            }
        }

        result
    }
}

/// Maps process signals onto orchestrator requests.
pub fn spawn_signal_handler(
    handle: OrchestratorHandle,
    notifier: Option<Notifier>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            let exit = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading");
                    if let Some(n) = &notifier {
                        if let Err(e) = n.notify(&NotifyMessage::status(StatusKind::Reloading, "reloading")) {
                            warn!(error = %e, "Failed to notify supervisor");
                        }
                    }
                    if !handle.request_reload() {
                        debug!("Reload already pending");
                    }
                    None
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    Some(true)
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    Some(true)
                }
                _ = sigquit.recv() => {
                    info!("Received SIGQUIT, forcing exit");
                    Some(false)
                }
                _ = sigusr2.recv() => {
                    info!("Received SIGUSR2, replacing process");
                    if !handle.request_replace(libc::SIGTERM) {
                        error!("Process replacement could not be requested");
                    }
                    None
                }
            };

            if let Some(graceful) = exit {
                if handle.exit(graceful).await.is_err() {
                    break;
                }
            }
        }
    }))
}

/// Forwards generation events to the supervisor.
pub fn spawn_event_notifier(
    mut events: broadcast::Receiver<GenerationEvent>,
    notifier: Option<Notifier>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed generation events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            debug!(?event, "Generation event");
            let Some(message) = event_message(&event) else {
                continue;
            };
            if let Some(n) = &notifier {
                if let Err(e) = n.notify(&message) {
                    warn!(error = %e, "Failed to notify supervisor");
                }
            }
        }
    })
}

/// Supervisor message for `event`, if it warrants one. Successful reloads
/// are announced by the ready hook once the generation serves.
fn event_message(event: &GenerationEvent) -> Option<NotifyMessage> {
    match event {
        GenerationEvent::ReloadFailed { current, error } => Some(NotifyMessage::status(
            StatusKind::Ready,
            &format!("reload failed, serving revision {current}: {error}"),
        )),
        GenerationEvent::Exiting { graceful } => Some(NotifyMessage::status(
            StatusKind::Stopping,
            if *graceful {
                "draining"
            } else {
                "stopping"
            },
        )),
        GenerationEvent::Configured { .. } | GenerationEvent::Retired { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("run").join("goned.pid"));

        assert_eq!(pid_file.read(), None);
        pid_file.write().unwrap();
        assert_eq!(pid_file.read(), Some(process::id()));
        assert_eq!(pid_file.running(), Some(process::id()));

        fs::write(pid_file.path(), "1\n").unwrap();
        assert!(!pid_file.remove_if_owned());
        assert!(pid_file.path().exists());

        pid_file.write().unwrap();
        assert!(pid_file.remove_if_owned());
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_event_messages() {
        let failed = event_message(&GenerationEvent::ReloadFailed {
            current: 3,
            error: "bad".to_string(),
        })
        .unwrap();
        assert_eq!(
            failed.to_payload(),
            "READY=1\nSTATUS=reload failed, serving revision 3: bad"
        );

        let stopping = event_message(&GenerationEvent::Exiting { graceful: false }).unwrap();
        assert_eq!(stopping.to_payload(), "STOPPING=1\nSTATUS=stopping");

        assert!(event_message(&GenerationEvent::Retired { revision: 1 }).is_none());
    }

    #[tokio::test]
    async fn test_config_file_builds_one_server_per_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("goned.toml");
        let sock = dir.path().join("b.sock");
        fs::write(
            &path,
            format!(
                r#"
                drain_timeout_secs = 2
                sync_reload = true
                fdstore = true

                [[listeners]]
                name = "a"
                network = "tcp4"
                address = "127.0.0.1:0"

                [[listeners]]
                name = "b"
                network = "unix"
                address = "{}"
                "#,
                sock.display()
            ),
        )
        .unwrap();

        let configure = ConfigFile::new(&path);
        let flag = configure.fdstore_flag();
        let registry = Arc::new(Registry::new());
        let orchestrator = Orchestrator::new(Arc::clone(&registry), configure);
        let handle = orchestrator.handle();

        let run = tokio::spawn(orchestrator.run());
        let mut events = handle.subscribe();
        // The first generation may already be configured by the time we
        // subscribe; the revision watch settles it either way.
        while handle.current_revision() == 0 {
            let _ = tokio::time::timeout(std::time::Duration::from_millis(50), events.recv()).await;
        }

        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(registry.active_count(), 2);

        handle.exit(true).await.unwrap();
        run.await.unwrap().unwrap();
        drop(dir);
    }
}
