//! Broker configuration context
//!
//! Built once at startup from the CLI surface and passed by `Arc` into the
//! acceptor, registry, and router. Nothing in the core reads ambient state.

use std::time::Duration;

/// Shared configuration for the broker core.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bound on every tunnel sub-protocol exchange (identity fetch/set,
    /// heartbeat, liveness probe). Proxied requests are not bounded by this.
    pub request_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(120_000),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatConfig {
    pub outgoing: OutgoingHeartbeatConfig,
    pub incoming: IncomingHeartbeatConfig,
}

/// Broker-pings-agent heartbeat, used for agents that do not report a
/// protocol version.
#[derive(Debug, Clone)]
pub struct OutgoingHeartbeatConfig {
    /// Nominal ping interval, seconds.
    pub default_secs: f64,
    /// Jitter window fraction applied to the interval.
    pub window: f64,
    /// Multiplier on the interval that produces the liveness budget the
    /// agent is told to wait for.
    pub overage: f64,
    pub enabled: bool,
}

impl Default for OutgoingHeartbeatConfig {
    fn default() -> Self {
        Self {
            default_secs: 120.0,
            window: 0.25,
            overage: 1.5,
            enabled: false,
        }
    }
}

/// Agent-pings-broker heartbeat, used for agents that report a protocol
/// version. Only takes effect on session transports that surface agent
/// pings (`TunnelSession::observes_pings`); on transports that acknowledge
/// pings internally, agent death is reported by the session itself.
#[derive(Debug, Clone)]
pub struct IncomingHeartbeatConfig {
    /// Assumed agent ping interval when the agent does not declare one,
    /// seconds.
    pub default_secs: u64,
    /// Multiplier turning the ping interval into the watchdog timeout.
    pub overage: f64,
    pub enabled: bool,
}

impl Default for IncomingHeartbeatConfig {
    fn default() -> Self {
        Self {
            default_secs: 120,
            overage: 2.0,
            enabled: true,
        }
    }
}
