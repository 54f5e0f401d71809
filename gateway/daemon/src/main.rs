//! Gateway Daemon - LLM Gateway Server
//!
//! Loads the gateway configuration, assembles the core with the pass-through
//! HTTP pipeline and an in-memory usage cache, and serves the tool protocol's
//! push carrier on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! gateway-daemon
//!
//! # Custom socket path and config file
//! gateway-daemon --socket-path /tmp/gateway.sock --config ./gateway.toml
//!
//! # Fail fast instead of queueing when every credential is busy
//! gateway-daemon --gate-policy fail-fast
//!
//! # Daemonize (run in background)
//! gateway-daemon --daemonize
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;
mod tools;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gateway_core::{
    load_config_from_path, AcquirePolicy, ConfigOverrides, Gateway, GatewayConfig, HttpPipeline,
    UpstreamConnector, UsageCache, UsageRecorder,
};
use server::{DaemonServer, ServerConfig};
use tools::GatewayConnector;

/// Connect timeout for upstream provider requests
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Saturation policy, as spelled on the command line
#[derive(Clone, Copy, Debug, ValueEnum)]
enum GatePolicyArg {
    /// Return resource-exhausted immediately
    FailFast,
    /// Wait for a credential to free up
    Queue,
}

impl From<GatePolicyArg> for AcquirePolicy {
    fn from(arg: GatePolicyArg) -> Self {
        match arg {
            GatePolicyArg::FailFast => Self::FailFast,
            GatePolicyArg::Queue => Self::Queue,
        }
    }
}

/// Gateway Daemon - LLM provider gateway with tool protocol sessions
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for tool protocol connections
    #[arg(short = 's', long, env = "GATEWAY_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// PID file path
    #[arg(long, env = "GATEWAY_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds a closed stream session stays replayable
    #[arg(long, value_name = "SECS")]
    close_ttl_secs: Option<u64>,

    /// What to do when every credential of a provider is busy
    #[arg(long, value_enum)]
    gate_policy: Option<GatePolicyArg>,

    /// Default upstream call timeout in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    dispatch_timeout_secs: Option<u64>,

    /// Idle seconds before a request-carrier session is reaped
    #[arg(long, value_name = "SECS")]
    protocol_idle_secs: Option<u64>,

    /// Maximum concurrent socket connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(secs) = self.close_ttl_secs {
            overrides = overrides.with_close_ttl_secs(secs);
        }
        if let Some(policy) = self.gate_policy {
            overrides = overrides.with_gate_policy(policy.into());
        }
        if let Some(secs) = self.dispatch_timeout_secs {
            overrides = overrides.with_dispatch_timeout_secs(secs);
        }
        if let Some(secs) = self.protocol_idle_secs {
            overrides = overrides.with_protocol_idle_secs(secs);
        }
        overrides
    }
}

/// Runtime directory for the socket and PID file
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/llm-gateway-$UID/`
fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("llm-gateway")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/llm-gateway-{uid}"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Remove the socket file if the server left it behind
fn remove_socket_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }
}

/// Refuse to start if the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks existence
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another gateway-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_daemon={level},gateway_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Fork to the background and detach from the terminal
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    setsid().context("setsid failed")?;

    // Second fork so the daemon can never reacquire a controlling terminal
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown.cancel();
    });
    Ok(())
}

/// Load the configuration file and apply command-line overrides
fn resolve_config(args: &Args) -> Result<GatewayConfig> {
    let config_path = args.config.clone().or_else(gateway_core::config::default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config
        .validate()
        .context("Configuration invalid after command-line overrides")?;
    info!(
        source = ?config.source(),
        file = ?config.config_file_path,
        providers = config.providers.len(),
        "Configuration resolved"
    );
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let socket_path = args
        .socket_path
        .clone()
        .unwrap_or_else(|| runtime_dir().join("gateway.sock"));
    let pid_path = args
        .pid_file
        .clone()
        .unwrap_or_else(|| runtime_dir().join("gateway.pid"));

    check_existing_daemon(&pid_path)?;
    let config = resolve_config(&args)?;

    // Fork before the runtime starts its worker threads
    if args.daemonize {
        info!("Daemonizing...");
        daemonize()?;
    }

    info!("Gateway daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());
    info!(socket_path = ?socket_path, pid_path = ?pid_path, "Runtime paths");

    write_pid_file(&pid_path)?;

    let result = tokio::runtime::Runtime::new()
        .context("Failed to start async runtime")
        .and_then(|runtime| runtime.block_on(run(&config, socket_path.clone(), args.max_connections)));

    remove_pid_file(&pid_path);
    remove_socket_file(&socket_path);

    match result {
        Ok(()) => {
            info!("Gateway daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

async fn run(config: &GatewayConfig, socket_path: PathBuf, max_connections: usize) -> Result<()> {
    let usage = Arc::new(UsageCache::new());
    let connector = Arc::new(GatewayConnector::new(Arc::clone(&usage)));
    let pipeline = HttpPipeline::new(UPSTREAM_CONNECT_TIMEOUT)?;
    let gateway = Arc::new(Gateway::from_config(
        config,
        Arc::new(pipeline),
        usage as Arc<dyn UsageRecorder>,
        Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
    ));
    connector.bind(&gateway);

    let shutdown = gateway.shutdown_token();
    spawn_signal_handler(shutdown.clone())?;
    let maintenance = gateway.spawn_maintenance();

    let server = DaemonServer::new(socket_path, Arc::clone(&gateway), ServerConfig { max_connections });
    let result = server.run(shutdown).await;

    info!("Shutting down...");
    gateway.shutdown().await;
    for task in maintenance {
        if let Err(e) = task.await {
            warn!(error = %e, "Maintenance task ended abnormally");
        }
    }
    result
}
