//! Relay Daemon - hub event fan-out to WebSocket listeners
//!
//! This binary runs as a background daemon, receiving events from the
//! central hub and forwarding the allowed ones to every connected
//! listener on `GET /websocket`.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! relayd start --hub-address hub.local:7100
//!
//! # Start the daemon (background/daemonized)
//! relayd start -d
//!
//! # Stop the daemon
//! relayd stop
//!
//! # Check daemon status
//! relayd status
//!
//! # Configure through the environment
//! HUB_ADDRESS=hub.local:7100 SYSTEM_ID=ITB-1101-CP1 relayd start
//!
//! # Enable debug logging
//! RUST_LOG=relayd=debug relayd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (listeners receive a close frame)

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::{EnvIdentity, KeyFilter, DEFAULT_FORWARDED_KEYS};
use relayd::broadcast::Broadcaster;
use relayd::config::{RelayConfig, DEFAULT_LISTEN_ADDR};
use relayd::hub::{HubClient, DEFAULT_HUB_PATH, DEFAULT_PUBLISH_BUFFER};
use relayd::registry::ConnectionRegistry;
use relayd::server::RelayServer;
use relayd::supervisor::LivenessConfig;
use relayd::telemetry::TelemetryReporter;

/// Buffer between the hub client and the broadcaster.
const EVENT_BUFFER: usize = 256;

/// Relay daemon - forwards hub events to WebSocket listeners
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Runtime settings, each overridable from the environment.
#[derive(Args, Debug, Clone)]
struct Settings {
    /// Address to accept listener connections on
    #[arg(long, global = true, env = "RELAY_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    listen: SocketAddr,

    /// Address (host:port) of the central event hub
    #[arg(long, global = true, env = "HUB_ADDRESS")]
    hub_address: Option<String>,

    /// Path of the hub's messenger endpoint
    #[arg(long, global = true, env = "RELAY_HUB_PATH", default_value = DEFAULT_HUB_PATH)]
    hub_path: String,

    /// Event keys forwarded to listeners
    #[arg(
        long = "forward-key",
        global = true,
        env = "RELAY_FORWARD_KEYS",
        value_delimiter = ',',
        default_values_t = DEFAULT_FORWARDED_KEYS.map(String::from)
    )]
    forward_keys: Vec<String>,

    /// Seconds between heartbeat pings
    #[arg(long, global = true, env = "RELAY_PING_PERIOD_SECS", default_value_t = 30)]
    ping_period_secs: u64,

    /// Seconds a listener may stay silent before it is dropped
    #[arg(long, global = true, env = "RELAY_READ_DEADLINE_SECS", default_value_t = 60)]
    read_deadline_secs: u64,

    /// Seconds allowed for a single write
    #[arg(long, global = true, env = "RELAY_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    write_timeout_secs: u64,

    /// Seconds between listener count reports
    #[arg(long, global = true, env = "RELAY_REPORT_INTERVAL_SECS", default_value_t = 60)]
    report_interval_secs: u64,
}

impl Settings {
    fn into_config(self) -> Result<RelayConfig> {
        let filter = KeyFilter::new(self.forward_keys).context("Invalid forwarded event key")?;

        let config = RelayConfig {
            listen_addr: self.listen,
            hub_address: self.hub_address.filter(|a| !a.trim().is_empty()),
            hub_path: self.hub_path,
            hub_publish_buffer: DEFAULT_PUBLISH_BUFFER,
            filter,
            liveness: LivenessConfig {
                ping_period: Duration::from_secs(self.ping_period_secs),
                read_deadline: Duration::from_secs(self.read_deadline_secs),
                write_timeout: Duration::from_secs(self.write_timeout_secs),
            },
            report_interval: Duration::from_secs(self.report_interval_secs),
            ..RelayConfig::default()
        };

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Returns the directory holding the PID and log files.
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("relayd")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("relayd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("relayd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the PID of the running daemon, clearing a stale PID file.
fn running_daemon() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Default to 'start' if no subcommand given
    let command = cli.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = running_daemon() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'relayd stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so configuration errors reach the terminal
            let config = cli.settings.into_config()?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();

            result
        }
        Command::Stop => match running_daemon() {
            Some(pid) => {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            }
            None => {
                println!("Daemon is not running.");
                Ok(())
            }
        },
        Command::Status => match running_daemon() {
            Some(pid) => {
                println!("Daemon is running (PID {pid})");
                println!("Log: {}", log_file_path().display());
                Ok(())
            }
            None => {
                println!("Daemon is not running.");
                process::exit(1);
            }
        },
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

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
async fn run_daemon(config: RelayConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("relayd=info".parse()?)
                .add_directive("relay_core=info".parse()?)
                .add_directive("relay_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Relay daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = ConnectionRegistry::new(config.liveness.write_timeout);

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let broadcaster = Broadcaster::new(registry.clone(), config.filter.clone())
        .with_write_timeout(config.liveness.write_timeout);
    let _broadcaster_handle = broadcaster.spawn(event_rx, cancel_token.clone());

    // Held so the broadcaster keeps running when no hub is configured
    let _idle_source = match config.hub() {
        Some(hub) => {
            info!(url = %hub.url(), "Connecting to hub");
            let (hub_client, _hub_handle) = HubClient::spawn(hub, event_tx, cancel_token.clone());

            let reporter = TelemetryReporter::new(
                registry.clone(),
                Arc::new(hub_client),
                Arc::new(EnvIdentity::default()),
            )
            .with_interval(config.report_interval);
            let _reporter_handle = reporter.spawn(cancel_token.clone());
            None
        }
        None => {
            warn!("No hub address configured; no events will be forwarded and telemetry is disabled");
            Some(event_tx)
        }
    };

    let server = RelayServer::new(&config, registry, cancel_token);
    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Relay daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
