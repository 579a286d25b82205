//! goned - zero-downtime socket server daemon
//!
//! Serves the listeners named in its configuration file, reloads them into a
//! new generation on SIGHUP, and replaces its own process on SIGUSR2
//! without closing a single listening socket.
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground
//! goned run --config /etc/gone/goned.toml
//!
//! # Run as a background daemon
//! goned run -d
//!
//! # Reload the configuration / replace the binary
//! goned reload
//! goned upgrade
//!
//! # Stop (gracefully, or abandoning in-flight work)
//! goned stop
//! goned stop --force
//!
//! # Enable debug logging
//! RUST_LOG=goned=debug goned run
//! ```

use std::fs::{self, File};
use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gone_core::Registry;
use goned::config::{resolve_path, DaemonConfig};
use goned::daemon::{is_process_running, Daemon, PidFile};
use goned::replace::{capture_startup, send_signal, take_handshake, ParentHandshake};

/// goned - zero-downtime socket server daemon
#[derive(Parser, Debug)]
#[command(name = "goned", version, about)]
struct Args {
    /// PID file location (default: $GONED_PID_FILE, else the user state directory)
    #[arg(long, global = true)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon
    Run {
        /// Configuration file (default: $GONED_CONFIG, else the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Reload the configuration of the running daemon
    Reload,
    /// Replace the running daemon with a fresh process
    Upgrade,
    /// Stop the running daemon
    Stop {
        /// Abandon in-flight work instead of draining it
        #[arg(long)]
        force: bool,

        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Show daemon status
    Status,
}

/// Returns the path to the log file used when daemonized.
fn log_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("gone")
        .join("goned.log")
}

/// Anchors a relative path at the current working directory.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Ok(cwd.join(path))
}

/// Returns the running daemon's PID or fails with a friendly message.
fn running_pid(pid_file: &PidFile) -> Result<u32> {
    pid_file
        .running()
        .ok_or_else(|| anyhow!("Daemon is not running ({})", pid_file.path().display()))
}

/// Waits until `done` holds or `timeout` passes.
fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    done()
}

fn main() -> Result<()> {
    // Must run before anything can change the working directory.
    capture_startup();

    let args = Args::parse();
    let pid_file = match args.pid_file {
        Some(path) => PidFile::new(absolute(path)?),
        None => PidFile::from_env_or_default(),
    };

    let command = args.command.unwrap_or(Command::Run {
        config: None,
        daemon: false,
    });

    match command {
        Command::Run { config, daemon } => {
            // Both read and clear environment variables, so they run while
            // this is the only thread.
            let parent = match take_handshake() {
                Ok(parent) => parent,
                Err(e) => {
                    eprintln!("Ignoring replacement handshake: {e}");
                    None
                }
            };
            let registry = Registry::inherit();

            // A replacement process runs alongside its parent until it is ready.
            let replacing = parent.is_some();
            if !replacing {
                if let Some(pid) = pid_file.running() {
                    eprintln!("Daemon is already running (PID {pid})");
                    eprintln!("Use 'goned upgrade' to replace it or 'goned stop' to stop it.");
                    process::exit(1);
                }
            }

            let config_path = resolve_path(config.as_deref())?;
            // Fail early, before detaching, on an unusable configuration.
            DaemonConfig::load(&config_path)?;
            // Reloads re-read the file after the working directory changed.
            let config_path = fs::canonicalize(&config_path)
                .with_context(|| format!("Failed to resolve {}", config_path.display()))?;

            if daemon && !replacing {
                // Daemonize before starting tokio runtime
                daemonize()?;
            }

            run_daemon(config_path, pid_file, registry, parent)
        }
        Command::Reload => {
            let pid = running_pid(&pid_file)?;
            send_signal(pid, libc::SIGHUP)?;
            println!("Reload requested (PID {pid}).");
            Ok(())
        }
        Command::Upgrade => {
            let pid = running_pid(&pid_file)?;
            send_signal(pid, libc::SIGUSR2)?;
            println!("Upgrade requested (PID {pid})...");

            let replaced = wait_until(Duration::from_secs(30), || {
                pid_file.read().is_some_and(|new| new != pid) && !is_process_running(pid)
            });
            match pid_file.read() {
                Some(new) if replaced => {
                    println!("Daemon replaced (PID {pid} -> {new}).");
                    Ok(())
                }
                _ => bail!("Daemon was not replaced within 30 seconds"),
            }
        }
        Command::Stop { force, timeout } => {
            let Some(pid) = pid_file.running() else {
                println!("Daemon is not running.");
                return Ok(());
            };
            let signal = if force { libc::SIGQUIT } else { libc::SIGTERM };
            println!("Stopping daemon (PID {pid})...");
            send_signal(pid, signal)?;

            if wait_until(Duration::from_secs(timeout), || !is_process_running(pid)) {
                println!("Daemon stopped.");
                Ok(())
            } else {
                eprintln!("Daemon did not stop within {timeout} seconds.");
                process::exit(1);
            }
        }
        Command::Status => {
            let Some(pid) = pid_file.running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };
            println!("Daemon is running (PID {pid})");
            if let Ok(path) = resolve_path(None) {
                if let Ok(config) = DaemonConfig::load(&path) {
                    println!("Config: {}", path.display());
                    for listener in &config.listeners {
                        println!(
                            "Listener: {} {} {}",
                            listener.name, listener.network, listener.address
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    // Ensure log directory exists
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::options()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to open log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(
    config_path: PathBuf,
    pid_file: PidFile,
    registry: Registry,
    parent: Option<ParentHandshake>,
) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("goned=info".parse()?)
                .add_directive("gone_core=info".parse()?)
                .add_directive("gone_notify=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config = %config_path.display(),
        "goned starting"
    );

    Daemon::new(config_path, pid_file, registry)
        .with_parent(parent)
        .run()
        .await
        .map_err(|e| anyhow!(e))
        .context("Daemon failed")?;

    info!("goned stopped");
    Ok(())
}
