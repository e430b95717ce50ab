//! Conduit Agent
//!
//! Keeps one session open to a rendezvous service, accepts connections on a
//! tunnel and relays each of them to a local backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use conduit_agent::backend::TcpConnector;
use conduit_agent::rendezvous::LocalRendezvous;
use conduit_agent::{Agent, AgentConfig};
use conduit_core::config::load_config;
use conduit_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "conduit-agent")]
#[command(version, about = "Conduit agent - relays tunnel connections to a local service")]
struct Args {
    /// Settings file (JSON); overrides the global settings file
    #[arg(long, env = "CONDUIT_CONFIG")]
    config: Option<PathBuf>,

    /// Local backend every connection is relayed to (e.g. "127.0.0.1:8080")
    #[arg(long)]
    backend_addr: Option<String>,

    /// Opaque metadata attached to the session
    #[arg(long)]
    session_metadata: Option<String>,

    /// Opaque metadata attached to the tunnel
    #[arg(long)]
    tunnel_metadata: Option<String>,

    /// Fixed public address to request for the tunnel
    #[arg(long)]
    remote_addr: Option<String>,

    /// Seconds between session heartbeats
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Authtoken presented during the session handshake
    #[arg(long)]
    authtoken: Option<String>,

    /// Host the local rendezvous binds service-assigned tunnels on
    #[arg(long, env = "CONDUIT_BIND_HOST")]
    bind_host: Option<String>,

    /// Log level filter for the agent (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "CONDUIT_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CONDUIT_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "CONDUIT_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
    fn apply(&self, settings: &mut conduit_core::Config) {
        if let Some(addr) = &self.backend_addr {
            settings.backend.addr.clone_from(addr);
        }
        if let Some(metadata) = &self.session_metadata {
            settings.session.metadata.clone_from(metadata);
        }
        if let Some(metadata) = &self.tunnel_metadata {
            settings.tunnel.metadata.clone_from(metadata);
        }
        if let Some(addr) = &self.remote_addr {
            settings.tunnel.remote_addr = Some(addr.clone());
        }
        if let Some(secs) = self.heartbeat_interval {
            settings.session.heartbeat_interval_secs = secs;
        }
        if let Some(token) = &self.authtoken {
            settings.session.authtoken = Some(token.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(
        &default_filter(env!("CARGO_PKG_NAME"), &args.log_level),
        args.log_json,
    );

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    #[cfg(feature = "metrics")]
    let metrics_guard = args
        .metrics_endpoint
        .as_deref()
        .map(conduit_core::metrics::init_metrics)
        .transpose()?;

    let mut settings = load_config(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;

    let config = AgentConfig::from_settings(&settings);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend_addr = %config.backend_addr,
        remote_addr = ?config.tunnel.remote_addr,
        heartbeat_secs = config.liveness.interval.as_secs(),
        reconnect = config.reconnect.is_some(),
        "Starting conduit-agent"
    );

    let mut rendezvous = LocalRendezvous::new();
    if let Some(host) = &args.bind_host {
        rendezvous = rendezvous.with_bind_host(host.clone());
    }
    if let Some(token) = &settings.session.authtoken {
        rendezvous = rendezvous.with_authtoken(token.clone());
    }
    let connector = TcpConnector::new(config.backend_connect_timeout);
    let agent = Arc::new(Agent::new(config, Arc::new(rendezvous), Arc::new(connector)));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut running = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run(shutdown_rx).await }
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the agent is ready (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let exit = tokio::select! {
        result = &mut running => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            None
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            None
        }
    };

    let result = match exit {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(Duration::from_secs(10), &mut running).await {
                Ok(result) => result,
                Err(_) => {
                    running.abort();
                    anyhow::bail!("Agent did not stop within 10s");
                }
            }
        }
    };

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard {
        guard.shutdown()?;
    }

    result??;
    info!("Agent stopped");
    Ok(())
}
