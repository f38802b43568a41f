//! Per-agent connection state machine
//!
//! One [`AgentConnection`] owns one tunnel session. After the acceptor hands
//! it over, the connection negotiates an identity, registers, and is then
//! driven by a single reactor task that multiplexes session events, both
//! heartbeat timers, and the external stop signal. All teardown paths funnel
//! through [`AgentConnection::finish`], which fires the one-shot close
//! notification exactly once no matter how many event sources observe the
//! failure.

use crate::config::BrokerConfig;
use crate::heartbeat::{incoming_timeout, OutgoingSchedule};
use backhaul_session::{
    SessionError, SessionEvent, SessionEvents, SessionRequest, SessionResult, TunnelSession,
};
use bytes::Bytes;
use http::StatusCode;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest identity body we accept from an agent.
const MAX_IDENTITY_BYTES: usize = 4096;

/// Fields an agent may carry in its handshake query string.
#[derive(Debug, Clone, Default)]
pub struct AgentHello {
    /// Self-reported identity (`kuid`), accepted verbatim when non-empty.
    pub identity: Option<String>,
    /// Protocol version tag (`ver`); presence selects the incoming
    /// heartbeat direction.
    pub version: Option<String>,
    /// Agent's declared ping interval in seconds (`hbSeconds`).
    pub heartbeat_seconds: Option<u64>,
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    NegotiatingIdentity,
    Registered,
    Closing,
    Closed,
}

/// Whether the close was solicited (stop, orderly peer close) or the result
/// of a failure. Both reach the same terminal state; the distinction is for
/// logging and arbitration bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Solicited,
    Errored,
}

/// Identity negotiation failures. All of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Agent has no identity")]
    NotFound,

    #[error("Identity request returned {0}")]
    BadStatus(StatusCode),

    #[error("Agent reported an empty identity")]
    Empty,

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct AgentConnection {
    session: Arc<dyn TunnelSession>,
    addr: String,
    offered_identity: Option<String>,
    version: Option<String>,
    heartbeat_seconds: Option<u64>,
    config: Arc<BrokerConfig>,
    identity: RwLock<String>,
    lifecycle: Mutex<Lifecycle>,
    close_guard: AtomicBool,
    closed_tx: watch::Sender<Option<CloseKind>>,
    /// Taken by the reactor task on spawn.
    events: Mutex<Option<SessionEvents>>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("addr", &self.addr)
            .field("identity", &self.identity())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl AgentConnection {
    pub fn new(
        session: Arc<dyn TunnelSession>,
        events: SessionEvents,
        addr: String,
        hello: AgentHello,
        config: Arc<BrokerConfig>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(None);

        info!(addr = %addr, session = %session.session_id(), "Agent handler started");

        Arc::new(Self {
            session,
            addr,
            offered_identity: hello.identity,
            version: hello.version,
            heartbeat_seconds: hello.heartbeat_seconds,
            config,
            identity: RwLock::new(String::new()),
            lifecycle: Mutex::new(Lifecycle::Connecting),
            close_guard: AtomicBool::new(false),
            closed_tx,
            events: Mutex::new(Some(events)),
        })
    }

    /// Identity of this agent. Empty until negotiation finishes, stable once
    /// the connection registers.
    pub fn identity(&self) -> String {
        self.identity.read().unwrap().clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.close_guard.load(Ordering::SeqCst)
    }

    /// Subscribe to the one-shot close notification. The value becomes
    /// `Some(kind)` exactly once, when the connection reaches `Closed`.
    pub fn closed_signal(&self) -> watch::Receiver<Option<CloseKind>> {
        self.closed_tx.subscribe()
    }

    pub fn session(&self) -> Arc<dyn TunnelSession> {
        self.session.clone()
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        *self.lifecycle.lock().unwrap() = state;
    }

    fn set_identity(&self, identity: &str) {
        *self.identity.write().unwrap() = identity.to_string();
    }

    /// Apply the configured request timeout to a tunnel sub-protocol call.
    async fn bounded<T>(&self, fut: impl Future<Output = SessionResult<T>>) -> SessionResult<T> {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Resolve this connection's identity.
    ///
    /// A non-empty identity offered in the handshake wins outright; otherwise
    /// the agent is asked over the freshly-established tunnel. Any failure is
    /// fatal to the connection (the caller is expected to stop it).
    pub async fn negotiate_identity(&self) -> Result<String, NegotiationError> {
        self.set_lifecycle(Lifecycle::NegotiatingIdentity);

        if let Some(offered) = self.offered_identity.as_deref() {
            if !offered.is_empty() {
                self.set_identity(offered);
                debug!(addr = %self.addr, identity = %offered, "Identity taken from handshake");
                return Ok(offered.to_string());
            }
        }

        self.fetch_identity().await
    }

    /// Ask the agent for its identity: `GET /agent/kuid`.
    async fn fetch_identity(&self) -> Result<String, NegotiationError> {
        info!(addr = %self.addr, "Requesting identity");

        let response = self
            .bounded(self.session.send_request(SessionRequest::get("/agent/kuid")))
            .await?;

        match response.status {
            StatusCode::OK => {
                let body = response.collect_body(MAX_IDENTITY_BYTES).await?;
                let identity = String::from_utf8_lossy(&body).trim().to_string();
                if identity.is_empty() {
                    warn!(addr = %self.addr, "Agent returned an empty identity");
                    return Err(NegotiationError::Empty);
                }
                self.set_identity(&identity);
                info!(addr = %self.addr, identity = %identity, "Received identity");
                Ok(identity)
            }
            // Identity regeneration is disabled: agents must self-report.
            StatusCode::NOT_FOUND => {
                warn!(addr = %self.addr, "Agent has no identity");
                Err(NegotiationError::NotFound)
            }
            status => {
                warn!(addr = %self.addr, status = %status, "Identity request failed");
                Err(NegotiationError::BadStatus(status))
            }
        }
    }

    /// Push an identity to the agent: `PUT /agent/kuid`.
    pub async fn put_identity(&self, identity: &str) -> Result<(), NegotiationError> {
        let request = SessionRequest::put("/agent/kuid")
            .with_body(Bytes::copy_from_slice(identity.as_bytes()));
        let response = self.bounded(self.session.send_request(request)).await?;

        match response.status {
            StatusCode::CREATED | StatusCode::NO_CONTENT => {
                self.set_identity(identity);
                info!(addr = %self.addr, identity = %identity, "Identity set on agent");
                Ok(())
            }
            status => {
                warn!(addr = %self.addr, status = %status, "Setting identity failed");
                Err(NegotiationError::BadStatus(status))
            }
        }
    }

    /// Assign a fresh identity to the agent. Kept off the default
    /// negotiation path; exposed for operator tooling.
    pub async fn regenerate_identity(&self) -> Result<String, NegotiationError> {
        let identity = uuid::Uuid::new_v4().to_string();
        self.put_identity(&identity).await?;
        Ok(identity)
    }

    /// Asynchronous liveness probe used by duplicate arbitration. Bounded by
    /// the request timeout so a silently dead peer cannot stall the caller.
    pub async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(self.config.request_timeout, self.session.ping()).await,
            Ok(Ok(()))
        )
    }

    /// Mark the connection registered. Called by the registry with the entry
    /// in place, before the reactor is spawned.
    pub(crate) fn mark_registered(&self) {
        self.set_lifecycle(Lifecycle::Registered);
        info!(addr = %self.addr, identity = %self.identity(), "Agent connected");
    }

    /// Stop the connection: disarm timers (by ending the reactor), close the
    /// session, notify once. Safe to call from any number of places.
    pub async fn stop(&self) {
        self.finish(CloseKind::Solicited).await;
    }

    async fn finish(&self, kind: CloseKind) {
        // Socket close, session error, heartbeat failure, and explicit stop
        // can all race here; only the first one runs the teardown.
        if self
            .close_guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.set_lifecycle(Lifecycle::Closing);
        self.session.close().await;
        self.set_lifecycle(Lifecycle::Closed);

        match kind {
            CloseKind::Solicited => {
                info!(addr = %self.addr, identity = %self.identity(), "Agent disconnected")
            }
            CloseKind::Errored => {
                warn!(addr = %self.addr, identity = %self.identity(), "Agent connection failed")
            }
        }

        // send_replace stores the value even with no receivers subscribed
        // yet, so a reaper that subscribes late still observes the close.
        self.closed_tx.send_replace(Some(kind));
    }

    /// `POST /heartbeat?timeoutSeconds=<budget>`; anything but `204` is a
    /// heartbeat failure.
    async fn send_heartbeat(&self, budget_secs: u64) -> SessionResult<()> {
        let request =
            SessionRequest::post(format!("/heartbeat?timeoutSeconds={}", budget_secs));
        let response = self.bounded(self.session.send_request(request)).await?;

        if response.status == StatusCode::NO_CONTENT {
            debug!(addr = %self.addr, identity = %self.identity(), "Heartbeat acknowledged");
            Ok(())
        } else {
            Err(SessionError::Protocol(format!(
                "heartbeat returned {}",
                response.status
            )))
        }
    }

    /// Spawn the reactor driving this connection until it closes.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let conn = self.clone();
        tokio::spawn(async move { conn.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut events = match self.events.lock().unwrap().take() {
            Some(events) => events,
            None => return,
        };
        let mut closed_rx = self.closed_tx.subscribe();

        // Heartbeat direction is selected by the version tag and is mutually
        // exclusive per connection. The incoming watchdog additionally needs
        // a session that can report agent pings at all.
        let outgoing_enabled =
            self.config.heartbeat.outgoing.enabled && self.version.is_none();
        let incoming_enabled = self.config.heartbeat.incoming.enabled
            && self.version.is_some()
            && self.session.observes_pings();

        let schedule = OutgoingSchedule::from_config(&self.config.heartbeat.outgoing);
        let incoming_window =
            incoming_timeout(&self.config.heartbeat.incoming, self.heartbeat_seconds);

        if outgoing_enabled {
            debug!(
                addr = %self.addr,
                identity = %self.identity(),
                bounds = ?schedule.bounds_ms(),
                budget_secs = schedule.budget_secs,
                "Outgoing heartbeat armed"
            );
        }
        if incoming_enabled {
            debug!(
                addr = %self.addr,
                identity = %self.identity(),
                timeout_ms = incoming_window.as_millis() as u64,
                "Incoming heartbeat watchdog armed"
            );
        }

        let outgoing_sleep = tokio::time::sleep(schedule.next_delay());
        tokio::pin!(outgoing_sleep);
        let incoming_sleep = tokio::time::sleep(incoming_window);
        tokio::pin!(incoming_sleep);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::PingObserved) => {
                        debug!(addr = %self.addr, identity = %self.identity(), "Agent ping");
                        incoming_sleep.as_mut().reset(Instant::now() + incoming_window);
                    }
                    Some(SessionEvent::Closed) | None => {
                        self.finish(CloseKind::Solicited).await;
                        break;
                    }
                    Some(SessionEvent::Errored(error)) => {
                        warn!(addr = %self.addr, identity = %self.identity(), error = %error, "Session error");
                        self.finish(CloseKind::Errored).await;
                        break;
                    }
                },
                // External stop (registry eviction, shutdown drain). The
                // watch ref must be dropped inside the branch: it holds a
                // read guard, and carrying it across the awaits in the
                // other arms would make this future !Send.
                _ = async {
                    let _ = closed_rx.wait_for(|state| state.is_some()).await;
                } => break,
                _ = &mut outgoing_sleep, if outgoing_enabled => {
                    match self.send_heartbeat(schedule.budget_secs).await {
                        Ok(()) => {
                            outgoing_sleep
                                .as_mut()
                                .reset(Instant::now() + schedule.next_delay());
                        }
                        Err(error) => {
                            warn!(addr = %self.addr, identity = %self.identity(), error = %error, "Heartbeat failed");
                            self.finish(CloseKind::Errored).await;
                            break;
                        }
                    }
                },
                _ = &mut incoming_sleep, if incoming_enabled => {
                    warn!(addr = %self.addr, identity = %self.identity(), "Agent heartbeat timed out");
                    self.finish(CloseKind::Errored).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_session::mock::MockSession;
    use http::Method;
    use std::time::Duration;

    fn make_conn(
        hello: AgentHello,
        config: BrokerConfig,
    ) -> (Arc<AgentConnection>, Arc<MockSession>) {
        let (session, events) = MockSession::new();
        let conn = AgentConnection::new(
            session.clone(),
            events,
            "10.0.0.1:50000".to_string(),
            hello,
            Arc::new(config),
        );
        (conn, session)
    }

    #[tokio::test]
    async fn offered_identity_wins_without_a_fetch() {
        let hello = AgentHello {
            identity: Some("abc123".to_string()),
            ..Default::default()
        };
        let (conn, session) = make_conn(hello, BrokerConfig::default());

        let identity = conn.negotiate_identity().await.unwrap();
        assert_eq!(identity, "abc123");
        assert_eq!(conn.identity(), "abc123");
        assert!(session.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_identity_is_fetched_from_the_agent() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        session.respond(Method::GET, "/agent/kuid", 200, "abc123\n");

        let identity = conn.negotiate_identity().await.unwrap();
        assert_eq!(identity, "abc123");
        assert_eq!(session.requests()[0].path, "/agent/kuid");
    }

    #[tokio::test]
    async fn fetch_404_fails_negotiation() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        session.respond(Method::GET, "/agent/kuid", 404, "");

        let result = conn.negotiate_identity().await;
        assert!(matches!(result, Err(NegotiationError::NotFound)));
    }

    #[tokio::test]
    async fn fetch_unexpected_status_fails_negotiation() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        session.respond(Method::GET, "/agent/kuid", 500, "");

        let result = conn.negotiate_identity().await;
        assert!(matches!(result, Err(NegotiationError::BadStatus(_))));
    }

    #[tokio::test]
    async fn fetch_empty_body_fails_negotiation() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        session.respond(Method::GET, "/agent/kuid", 200, "  \n");

        let result = conn.negotiate_identity().await;
        assert!(matches!(result, Err(NegotiationError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out_against_a_silent_agent() {
        let config = BrokerConfig {
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (conn, session) = make_conn(AgentHello::default(), config);
        session.respond(Method::GET, "/agent/kuid", 200, "abc123");
        session.set_request_delay(Duration::from_secs(60));

        let result = conn.negotiate_identity().await;
        assert!(matches!(
            result,
            Err(NegotiationError::Session(SessionError::Timeout))
        ));
    }

    #[tokio::test]
    async fn put_identity_round_trip() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        session.respond(Method::PUT, "/agent/kuid", 204, "");

        conn.put_identity("fresh-id").await.unwrap();
        assert_eq!(conn.identity(), "fresh-id");
        assert_eq!(session.requests()[0].body, Bytes::from("fresh-id"));
    }

    #[tokio::test]
    async fn put_identity_failure_leaves_identity_unset() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        session.respond(Method::PUT, "/agent/kuid", 500, "");

        let result = conn.put_identity("fresh-id").await;
        assert!(matches!(result, Err(NegotiationError::BadStatus(_))));
        assert_eq!(conn.identity(), "");
    }

    #[tokio::test]
    async fn regenerate_identity_sets_a_new_one() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        session.respond(Method::PUT, "/agent/kuid", 201, "");

        let identity = conn.regenerate_identity().await.unwrap();
        assert!(!identity.is_empty());
        assert_eq!(conn.identity(), identity);
    }

    #[tokio::test]
    async fn close_notification_fires_exactly_once() {
        let (conn, _session) = make_conn(AgentHello::default(), BrokerConfig::default());
        let mut closed = conn.closed_signal();

        conn.stop().await;
        closed.wait_for(|state| state.is_some()).await.unwrap();
        assert_eq!(*closed.borrow(), Some(CloseKind::Solicited));

        // Competing close paths are absorbed by the guard; the recorded
        // kind never changes.
        conn.finish(CloseKind::Errored).await;
        conn.stop().await;
        assert_eq!(*closed.borrow(), Some(CloseKind::Solicited));
        assert_eq!(conn.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn reactor_future_is_send() {
        // tokio::spawn requires it; checked here so a regression fails
        // this test instead of every spawn site at once.
        fn require_send<F: std::future::Future + Send>(_: F) {}

        let (session, events) = MockSession::new();
        let conn = AgentConnection::new(
            session,
            events,
            "10.0.0.1:50000".to_string(),
            AgentHello::default(),
            Arc::new(BrokerConfig::default()),
        );
        require_send(conn.run());
    }

    #[tokio::test]
    async fn reactor_closes_on_session_error() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        conn.mark_registered();
        conn.spawn();

        session.emit(SessionEvent::Errored("connection reset".to_string()));

        let mut closed = conn.closed_signal();
        closed.wait_for(|state| state.is_some()).await.unwrap();
        assert_eq!(*closed.borrow(), Some(CloseKind::Errored));
    }

    #[tokio::test]
    async fn reactor_closes_on_orderly_session_close() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        conn.mark_registered();
        conn.spawn();

        session.emit(SessionEvent::Closed);

        let mut closed = conn.closed_signal();
        closed.wait_for(|state| state.is_some()).await.unwrap();
        assert_eq!(*closed.borrow(), Some(CloseKind::Solicited));
    }

    fn outgoing_config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.heartbeat.outgoing.enabled = true;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn outgoing_heartbeats_recur_and_carry_the_budget() {
        let (conn, session) = make_conn(AgentHello::default(), outgoing_config());
        session.respond(Method::POST, "/heartbeat", 204, "");
        conn.mark_registered();
        conn.spawn();

        // Upper jitter bound is 90s; three cycles fit comfortably here.
        tokio::time::sleep(Duration::from_secs(300)).await;

        let heartbeats: Vec<_> = session
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::POST)
            .collect();
        assert!(heartbeats.len() >= 3, "saw {} heartbeats", heartbeats.len());
        for beat in heartbeats {
            assert_eq!(beat.path, "/heartbeat?timeoutSeconds=180");
        }
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_outgoing_heartbeat_is_fatal() {
        let (conn, session) = make_conn(AgentHello::default(), outgoing_config());
        session.respond(Method::POST, "/heartbeat", 500, "");
        conn.mark_registered();
        conn.spawn();

        let mut closed = conn.closed_signal();
        closed.wait_for(|state| state.is_some()).await.unwrap();
        assert_eq!(*closed.borrow(), Some(CloseKind::Errored));
    }

    #[tokio::test(start_paused = true)]
    async fn versioned_agents_are_not_pinged() {
        let hello = AgentHello {
            version: Some("2".to_string()),
            ..Default::default()
        };
        let (conn, session) = make_conn(hello, outgoing_config());
        conn.mark_registered();
        conn.spawn();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(session.requests().is_empty());
    }

    fn incoming_hello() -> AgentHello {
        AgentHello {
            version: Some("2".to_string()),
            heartbeat_seconds: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn agent_pings_keep_the_watchdog_quiet() {
        let (conn, session) = make_conn(incoming_hello(), BrokerConfig::default());
        conn.mark_registered();
        conn.spawn();

        // Watchdog window is 1s * 2.0 = 2s; ping every second.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            session.emit(SessionEvent::PingObserved);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_agent_pings_close_the_connection() {
        let (conn, session) = make_conn(incoming_hello(), BrokerConfig::default());
        conn.mark_registered();
        conn.spawn();

        session.emit(SessionEvent::PingObserved);

        let mut closed = conn.closed_signal();
        closed.wait_for(|state| state.is_some()).await.unwrap();
        assert_eq!(*closed.borrow(), Some(CloseKind::Errored));
    }

    #[tokio::test]
    async fn probe_reflects_ping_outcome() {
        let (conn, session) = make_conn(AgentHello::default(), BrokerConfig::default());
        assert!(conn.probe().await);

        session.set_ping(false, Duration::ZERO);
        assert!(!conn.probe().await);
    }
}
