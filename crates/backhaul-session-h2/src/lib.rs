//! HTTP/2 tunnel session
//!
//! Wraps an already-open bidirectional byte stream (the TLS socket an agent
//! connected with) in an `h2` *client* session, inverting the roles on that
//! socket: the agent becomes an HTTP/2 server and the broker issues requests
//! to it. No new connection is opened.
//!
//! # Stream mapping
//!
//! - Each broker-to-agent exchange = one HTTP/2 bidirectional stream
//! - Liveness probes = HTTP/2 PING frames
//! - Session teardown = dropping the connection driver, which closes the
//!   underlying socket

pub mod config;
pub mod session;

pub use config::H2SessionConfig;
pub use session::H2Session;
