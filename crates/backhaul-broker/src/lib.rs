//! Broker core: per-agent connection state machines and the connection
//! registry that enforces identity uniqueness.
//!
//! Each connected agent is driven by one [`AgentConnection`] reactor task;
//! the [`ConnectionRegistry`] is the only shared mutable state. Its map is
//! mutated under one async mutex, while duplicate arbitration probes run
//! unlocked against a snapshot and revalidate before committing.

pub mod agent;
pub mod config;
pub mod heartbeat;
pub mod registry;

pub use agent::{AgentConnection, AgentHello, CloseKind, Lifecycle, NegotiationError};
pub use config::{BrokerConfig, HeartbeatConfig, IncomingHeartbeatConfig, OutgoingHeartbeatConfig};
pub use heartbeat::{incoming_timeout, OutgoingSchedule};
pub use registry::{ConnectionRegistry, RegisterOutcome};
