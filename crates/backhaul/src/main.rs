use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backhaul_relay::{RelayMetrics, SessionError, SessionLifecycle, TcpDialer};
use backhaul_ssh::{SshError, SshTransport};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod diagnostics;

use config::{ConfigLayer, TunnelConfig};

/// Backhaul - expose a local service through a port on an SSH relay host
#[derive(Parser, Debug)]
#[command(name = "backhaul", version)]
#[command(about = "Expose a local service through a remote port on an SSH relay host")]
struct Cli {
    /// Config file (default: ~/.config/backhaul/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay host to connect to
    #[arg(long)]
    proxy_host: Option<String>,

    /// SSH user on the relay host
    #[arg(long)]
    proxy_user: Option<String>,

    /// SSH port of the relay host
    #[arg(long)]
    proxy_ssh_port: Option<u16>,

    /// Public port opened on the relay host
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Address the relay host binds the public port to
    #[arg(long)]
    remote_bind: Option<String>,

    /// Host of the local service
    #[arg(long)]
    local_host: Option<String>,

    /// Port of the local service
    #[arg(long)]
    local_port: Option<u16>,

    /// Private key used for authentication
    #[arg(long)]
    key: Option<String>,

    /// Host key verification: accept-any or known-hosts
    #[arg(long)]
    host_key_policy: Option<String>,

    /// Close connections idle in both directions for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Maximum number of concurrently relayed connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Timeout in seconds for the SSH and local connects
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Start a new session when the current one dies
    #[arg(long)]
    reconnect: bool,

    /// Seconds to wait between reconnect attempts
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Log relay statistics every N seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    stats_interval: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            proxy_host: self.proxy_host.clone(),
            proxy_user: self.proxy_user.clone(),
            proxy_ssh_port: self.proxy_ssh_port,
            proxy_port: self.proxy_port,
            remote_bind: self.remote_bind.clone(),
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            key: self.key.clone(),
            host_key_policy: self.host_key_policy.clone(),
            idle_timeout_secs: self.idle_timeout,
            max_connections: self.max_connections,
            connect_timeout_secs: self.connect_timeout,
            reconnect: self.reconnect.then_some(true),
            reconnect_delay_secs: self.reconnect_delay,
        }
    }

    fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}

/// Why a tunnel session ended
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    run_tunnel(config, cli.stats_interval(), shutdown).await
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("backhaul={}", level).parse()?)
                .add_directive(format!("backhaul_relay={}", level).parse()?)
                .add_directive(format!("backhaul_ssh={}", level).parse()?),
        )
        .init();

    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<TunnelConfig> {
    let env = ConfigLayer::from_env().context("Invalid environment variable")?;
    let file = ConfigLayer::load_file(cli.config.as_deref()).context("Invalid config file")?;
    let config = TunnelConfig::resolve(cli.layer().or(env).or(file))?;
    Ok(config)
}

/// What the reconnect loop does after a failed session
enum Recovery {
    /// Explained by a diagnostic: show it and exit non-zero
    Fatal(Box<dyn miette::Diagnostic + Send + Sync>),
    Reconnect,
    Fail,
}

fn recovery(error: &TunnelError, reconnect: bool) -> Recovery {
    match diagnostics::analyze(error) {
        Some(diagnostic) => Recovery::Fatal(diagnostic),
        None if reconnect => Recovery::Reconnect,
        None => Recovery::Fail,
    }
}

/// Run sessions until shutdown, a fatal error, or (without reconnect) the first failure
async fn run_tunnel(
    config: TunnelConfig,
    stats_interval: Option<Duration>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(
        "Exposing {}:{} on {}:{} via {}",
        config.local_host,
        config.local_port,
        config.remote_bind,
        config.proxy_port,
        config.proxy_host
    );

    let metrics = RelayMetrics::new();
    let dialer = Arc::new(
        TcpDialer::new(&config.local_host, config.local_port)
            .with_connect_timeout(Some(config.connect_timeout)),
    );

    loop {
        let result = run_session(
            &config,
            dialer.clone(),
            metrics.clone(),
            stats_interval,
            shutdown.clone(),
        )
        .await;

        match result {
            Ok(()) => break,
            Err(e) => match recovery(&e, config.reconnect) {
                Recovery::Fatal(diagnostic) => {
                    // Shown here, never reported again through anyhow
                    diagnostics::display(diagnostic.as_ref());
                    std::process::exit(1);
                }
                Recovery::Fail => return Err(e).context("Tunnel terminated"),
                Recovery::Reconnect => {
                    tracing::error!("Tunnel error: {}", e);
                    tracing::info!(
                        "Reconnecting in {} seconds...",
                        config.reconnect_delay.as_secs()
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(config.reconnect_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            },
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        "Shutdown complete after {}s: {} connections relayed, {} bytes in, {} bytes out",
        snapshot.uptime.as_secs(),
        snapshot.accepted,
        snapshot.bytes_remote_to_local,
        snapshot.bytes_local_to_remote
    );
    Ok(())
}

/// One session: connect, open the public port, serve until it dies
///
/// Returns `Ok(())` only when `shutdown` fires.
async fn run_session(
    config: &TunnelConfig,
    dialer: Arc<TcpDialer>,
    metrics: RelayMetrics,
    stats_interval: Option<Duration>,
    shutdown: CancellationToken,
) -> Result<(), TunnelError> {
    let ssh_config = config.ssh_config();
    let transport = tokio::select! {
        result = SshTransport::connect(&ssh_config) => result?,
        _ = shutdown.cancelled() => return Ok(()),
    };

    let mut session = SessionLifecycle::with_metrics(transport, metrics.clone());
    session
        .establish(&config.remote_bind, config.proxy_port)
        .await?;

    tracing::info!(
        "Tunnel up: {}:{} -> {}:{}",
        config.proxy_host,
        config.proxy_port,
        config.local_host,
        config.local_port
    );

    let stop_stats = CancellationToken::new();
    let _stats_guard = stop_stats.clone().drop_guard();
    if let Some(every) = stats_interval {
        tokio::spawn(log_stats(metrics, every, stop_stats));
    }

    session
        .serve(dialer, config.serve_options(), shutdown)
        .await?;

    Ok(())
}

async fn log_stats(metrics: RelayMetrics, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let s = metrics.snapshot();
                tracing::info!(
                    "Stats: {} active, {} accepted, {} dial failures, {} copy errors, {} idle timeouts, {} B in, {} B out",
                    s.active_pairs,
                    s.accepted,
                    s.dial_failures,
                    s.copy_errors,
                    s.idle_timeouts,
                    s.bytes_remote_to_local,
                    s.bytes_local_to_remote
                );
            }
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
