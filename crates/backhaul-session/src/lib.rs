//! Tunnel session abstraction
//!
//! A [`TunnelSession`] is the broker's view of one connected agent: a
//! multiplexed channel over which the broker acts as the HTTP *client*,
//! even though the agent opened the underlying connection. Everything the
//! broker does to an agent (identity fetch, heartbeat, request proxying,
//! liveness probing) goes through this trait, so the concrete multiplexing
//! protocol stays a deployment detail.
//!
//! Connection-level lifecycle (close, transport failure, inbound protocol
//! pings) is reported out-of-band through a [`SessionEvent`] channel handed
//! to whoever owns the connection's state machine.

pub mod mock;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{HeaderMap, Method, StatusCode};
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out")]
    Timeout,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A streamed HTTP body: chunks are delivered as they arrive and are never
/// accumulated by the session layer.
pub type BodyStream = Pin<Box<dyn Stream<Item = SessionResult<Bytes>> + Send + 'static>>;

/// Lifecycle notifications emitted by a session, consumed by the agent
/// connection's reactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The agent sent a protocol-level ping.
    PingObserved,
    /// The session ended in an orderly fashion.
    Closed,
    /// The session ended because the transport failed.
    Errored(String),
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// One request issued over the tunnel.
pub struct SessionRequest {
    pub method: Method,
    /// Path plus optional query string, e.g. `/heartbeat?timeoutSeconds=180`.
    pub path: String,
    pub headers: HeaderMap,
    /// `None` means an empty body with immediate end-of-stream.
    pub body: Option<BodyStream>,
}

impl SessionRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Attach a fixed body.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(Box::pin(futures::stream::once(async move { Ok(body) })));
        self
    }

    /// Attach an already-streaming body (used by the request router so
    /// inbound bodies are piped through without buffering).
    pub fn with_streamed_body(mut self, body: BodyStream) -> Self {
        self.body = Some(body);
        self
    }
}

impl std::fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

/// The agent's response to a [`SessionRequest`].
pub struct SessionResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl SessionResponse {
    /// Drain the body into memory, refusing bodies larger than `limit`.
    ///
    /// Only the small sub-protocol exchanges (identity, heartbeat) use this;
    /// proxied responses are streamed instead.
    pub async fn collect_body(mut self, limit: usize) -> SessionResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(SessionError::Protocol(format!(
                    "Response body exceeds {} bytes",
                    limit
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for SessionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResponse")
            .field("status", &self.status)
            .finish()
    }
}

/// A multiplexed session toward one agent, with the broker as client.
#[async_trait]
pub trait TunnelSession: Send + Sync + 'static {
    /// Open a new exchange over the session. Resolves once the agent has
    /// produced response headers; the response body streams afterwards.
    async fn send_request(&self, request: SessionRequest) -> SessionResult<SessionResponse>;

    /// Protocol-level liveness probe. Resolves when the agent acknowledges.
    async fn ping(&self) -> SessionResult<()>;

    /// Whether this session can report agent-initiated pings as
    /// [`SessionEvent::PingObserved`]. Sessions that cannot still report
    /// failure through [`SessionEvent::Errored`] when the transport dies.
    fn observes_pings(&self) -> bool;

    /// Tear the session down. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Stable identifier for logging.
    fn session_id(&self) -> String;
}
