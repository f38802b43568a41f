//! Heartbeat timing math

use crate::config::{IncomingHeartbeatConfig, OutgoingHeartbeatConfig};
use rand::Rng;
use std::time::Duration;

/// Precomputed outgoing-heartbeat timing for one connection.
///
/// The two raw bounds are `default*(1-window)*1000` and `default*window*1000`
/// milliseconds; each ping delay is drawn uniformly from the inclusive range
/// between the smaller and the larger of the two. For typical window values
/// this lands below the nominal interval rather than symmetrically around
/// it; the liveness budget handed to the agent covers the gap.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingSchedule {
    lower_ms: u64,
    upper_ms: u64,
    /// Whole seconds the agent is told to tolerate between pings:
    /// `floor(default * overage)`.
    pub budget_secs: u64,
}

impl OutgoingSchedule {
    pub fn from_config(config: &OutgoingHeartbeatConfig) -> Self {
        let a = (config.default_secs * (1.0 - config.window) * 1000.0) as u64;
        let b = (config.default_secs * config.window * 1000.0) as u64;
        Self {
            lower_ms: a.min(b),
            upper_ms: a.max(b),
            budget_secs: (config.default_secs * config.overage).floor() as u64,
        }
    }

    /// Draw the next ping delay.
    pub fn next_delay(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.lower_ms..=self.upper_ms);
        Duration::from_millis(ms)
    }

    pub fn bounds_ms(&self) -> (u64, u64) {
        (self.lower_ms, self.upper_ms)
    }
}

/// Watchdog timeout for agent-initiated heartbeats:
/// `(agent-declared interval or configured default) * overage`, milliseconds.
pub fn incoming_timeout(config: &IncomingHeartbeatConfig, agent_secs: Option<u64>) -> Duration {
    let base = agent_secs.unwrap_or(config.default_secs) as f64;
    Duration::from_millis((base * config.overage * 1000.0) as u64)
}
