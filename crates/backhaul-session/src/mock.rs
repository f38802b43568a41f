//! Scriptable in-memory session for tests
//!
//! Downstream crates drive their state-machine and router tests through this
//! instead of a real multiplexed connection, so it lives in the library
//! proper rather than behind `#[cfg(test)]`.

use crate::{
    BodyStream, SessionError, SessionEvent, SessionEventSender, SessionEvents, SessionRequest,
    SessionResponse, SessionResult, TunnelSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A request the mock has seen, with its body fully drained.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct CannedResponse {
    status: StatusCode,
    body: Bytes,
}

/// Test double for [`TunnelSession`].
///
/// Responses are keyed by method and path (query string ignored); unscripted
/// exchanges answer `404`. Pings succeed by default and can be delayed or
/// failed to exercise probe races.
pub struct MockSession {
    canned: Mutex<HashMap<(Method, String), CannedResponse>>,
    recorded: Mutex<Vec<RecordedRequest>>,
    ping_ok: AtomicBool,
    ping_delay: Mutex<Duration>,
    request_delay: Mutex<Duration>,
    fail_requests: AtomicBool,
    closed: AtomicBool,
    events: SessionEventSender,
}

impl MockSession {
    pub fn new() -> (Arc<Self>, SessionEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            canned: Mutex::new(HashMap::new()),
            recorded: Mutex::new(Vec::new()),
            ping_ok: AtomicBool::new(true),
            ping_delay: Mutex::new(Duration::ZERO),
            request_delay: Mutex::new(Duration::ZERO),
            fail_requests: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        });
        (session, events_rx)
    }

    /// Script the response for `method path`.
    pub fn respond(&self, method: Method, path: &str, status: u16, body: &str) {
        let canned = CannedResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        };
        self.canned
            .lock()
            .unwrap()
            .insert((method, path.to_string()), canned);
    }

    /// Control the outcome and latency of [`TunnelSession::ping`].
    pub fn set_ping(&self, ok: bool, delay: Duration) {
        self.ping_ok.store(ok, Ordering::SeqCst);
        *self.ping_delay.lock().unwrap() = delay;
    }

    /// Delay every [`TunnelSession::send_request`] by `delay`, simulating a
    /// slow or stalled agent.
    pub fn set_request_delay(&self, delay: Duration) {
        *self.request_delay.lock().unwrap() = delay;
    }

    /// Make every subsequent request fail as if the transport broke
    /// mid-exchange.
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Push a session event, e.g. a simulated transport failure.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// All requests observed so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().unwrap().clone()
    }

    fn strip_query(path: &str) -> String {
        path.split('?').next().unwrap_or(path).to_string()
    }
}

#[async_trait]
impl TunnelSession for MockSession {
    async fn send_request(&self, request: SessionRequest) -> SessionResult<SessionResponse> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(SessionError::Connection("simulated failure".to_string()));
        }

        let delay = *self.request_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut body = Vec::new();
        if let Some(mut stream) = request.body {
            while let Some(chunk) = stream.next().await {
                body.extend_from_slice(&chunk?);
            }
        }

        let key = (request.method.clone(), Self::strip_query(&request.path));
        self.recorded.lock().unwrap().push(RecordedRequest {
            method: request.method,
            path: request.path,
            body: Bytes::from(body),
        });

        let canned = self
            .canned
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(CannedResponse {
                status: StatusCode::NOT_FOUND,
                body: Bytes::new(),
            });

        let body: BodyStream = Box::pin(futures::stream::once(async move { Ok(canned.body) }));
        Ok(SessionResponse {
            status: canned.status,
            headers: HeaderMap::new(),
            body,
        })
    }

    async fn ping(&self) -> SessionResult<()> {
        let delay = *self.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::Connection("ping failed".to_string()))
        }
    }

    fn observes_pings(&self) -> bool {
        true
    }

    async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.events.send(SessionEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> String {
        "mock".to_string()
    }
}
