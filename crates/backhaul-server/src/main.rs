//! Reverse-tunnel broker daemon
//!
//! Runs two listeners: a TLS listener that agents dial out to and upgrade
//! into multiplexed sessions, and a plain HTTP listener where external
//! callers reach those agents by identity.

mod acceptor;
mod handshake;
mod read_ahead;
mod router;
mod tls;

use acceptor::AgentAcceptor;
use anyhow::{Context, Result};
use backhaul_broker::{
    BrokerConfig, ConnectionRegistry, HeartbeatConfig, IncomingHeartbeatConfig,
    OutgoingHeartbeatConfig,
};
use backhaul_session_h2::H2SessionConfig;
use clap::Parser;
use router::PublicRouter;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reverse-tunnel broker: agents dial out, callers reach them by identity
#[derive(Parser, Debug)]
#[command(name = "backhauld")]
#[command(about = "Run the backhaul reverse-tunnel broker", long_about = None)]
struct Args {
    /// Agent listener bind address (TLS)
    #[arg(long, default_value = "0.0.0.0:9443")]
    agent_addr: String,

    /// Public listener bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    public_addr: String,

    /// TLS certificate file for the agent listener (PEM)
    #[arg(long, env = "BACKHAUL_TLS_CERT")]
    tls_cert: PathBuf,

    /// TLS private key file for the agent listener (PEM)
    #[arg(long, env = "BACKHAUL_TLS_KEY")]
    tls_key: PathBuf,

    /// Timeout for tunnel sub-protocol exchanges (identity, heartbeat,
    /// liveness probes), in milliseconds
    #[arg(long, default_value_t = 120_000)]
    request_timeout_ms: u64,

    /// Ping agents that do not report a protocol version
    #[arg(long)]
    outgoing_heartbeat: bool,

    /// Nominal broker-to-agent ping interval, seconds
    #[arg(long, default_value_t = 120.0)]
    outgoing_heartbeat_secs: f64,

    /// Jitter window fraction applied to the ping interval
    #[arg(long, default_value_t = 0.25)]
    outgoing_heartbeat_window: f64,

    /// Multiplier turning the ping interval into the budget reported to
    /// the agent
    #[arg(long, default_value_t = 1.5)]
    outgoing_heartbeat_overage: f64,

    /// Disable the watchdog for agents that ping the broker. The watchdog
    /// only arms on session transports that surface agent pings; the
    /// HTTP/2 transport acknowledges them internally, so there agent death
    /// is detected by the connection driver instead
    #[arg(long)]
    no_incoming_heartbeat: bool,

    /// Assumed agent ping interval when undeclared, seconds
    #[arg(long, default_value_t = 120)]
    incoming_heartbeat_secs: u64,

    /// Multiplier turning the agent's ping interval into the watchdog
    /// timeout
    #[arg(long, default_value_t = 2.0)]
    incoming_heartbeat_overage: f64,

    /// Shutdown drain poll interval, milliseconds
    #[arg(long, default_value_t = 500)]
    drain_poll_ms: u64,

    /// Give up draining after this many polls without progress
    #[arg(long, default_value_t = 10)]
    drain_give_up: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            heartbeat: HeartbeatConfig {
                outgoing: OutgoingHeartbeatConfig {
                    default_secs: self.outgoing_heartbeat_secs,
                    window: self.outgoing_heartbeat_window,
                    overage: self.outgoing_heartbeat_overage,
                    enabled: self.outgoing_heartbeat,
                },
                incoming: IncomingHeartbeatConfig {
                    default_secs: self.incoming_heartbeat_secs,
                    overage: self.incoming_heartbeat_overage,
                    enabled: !self.no_incoming_heartbeat,
                },
            },
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Error listening for shutdown signal: {}", e);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error installing SIGTERM handler: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting backhaul broker");
    info!("Agent endpoint: {}", args.agent_addr);
    info!("Public endpoint: {}", args.public_addr);

    let config = std::sync::Arc::new(args.broker_config());
    let tls_acceptor = tls::build_acceptor(&args.tls_cert, &args.tls_key)
        .context("Failed to set up TLS for the agent listener")?;

    let agent_listener = TcpListener::bind(&args.agent_addr)
        .await
        .with_context(|| format!("Failed to bind agent listener on {}", args.agent_addr))?;
    let public_listener = TcpListener::bind(&args.public_addr)
        .await
        .with_context(|| format!("Failed to bind public listener on {}", args.public_addr))?;

    let registry = ConnectionRegistry::new();

    let agent_acceptor =
        AgentAcceptor::new(registry.clone(), config, H2SessionConfig::default());
    let agent_handle = tokio::spawn(agent_acceptor.run(agent_listener, tls_acceptor));

    let public_router = PublicRouter::new(registry.clone());
    let public_handle = tokio::spawn(public_router.serve(public_listener));

    info!("Broker running, press Ctrl+C to stop");
    shutdown_signal().await;
    info!("Shutdown signal received, stopping listeners");

    agent_handle.abort();
    public_handle.abort();

    let drained = registry
        .drain(Duration::from_millis(args.drain_poll_ms), args.drain_give_up)
        .await;
    if !drained {
        warn!("Some agent connections did not close in time");
    }

    info!("Broker stopped");
    Ok(())
}
