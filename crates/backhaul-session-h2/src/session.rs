//! h2 client session implementation

use crate::H2SessionConfig;
use async_trait::async_trait;
use backhaul_session::{
    BodyStream, SessionError, SessionEvent, SessionEventSender, SessionRequest, SessionResponse,
    SessionResult, TunnelSession,
};
use bytes::Bytes;
use futures::StreamExt;
use h2::client::SendRequest;
use h2::{Ping, PingPong, RecvStream, SendStream};
use http::Uri;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace, warn};

/// HTTP/2 client session over an agent's own socket.
pub struct H2Session {
    session_id: String,
    send_request: Mutex<SendRequest<Bytes>>,
    ping_pong: Mutex<PingPong>,
    closed: Arc<AtomicBool>,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for H2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Session")
            .field("session_id", &self.session_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl H2Session {
    /// Perform the client-side HTTP/2 handshake over `io` and spawn the
    /// connection driver. Close and error outcomes are delivered on `events`.
    pub async fn handshake<T>(
        io: T,
        config: &H2SessionConfig,
        events: SessionEventSender,
    ) -> SessionResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = format!("h2-{}", uuid::Uuid::new_v4());

        let (send_request, mut connection) = h2::client::Builder::new()
            .initial_window_size(config.initial_window_size)
            .initial_connection_window_size(config.initial_connection_window_size)
            .max_frame_size(config.max_frame_size)
            .handshake::<T, Bytes>(io)
            .await
            .map_err(|e| SessionError::Connection(format!("h2 handshake failed: {}", e)))?;

        let ping_pong = connection
            .ping_pong()
            .ok_or_else(|| SessionError::Protocol("h2 ping handle unavailable".to_string()))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        // Driver task: owns the connection future. Everything the session
        // does stalls unless this is polled, and dropping it closes the
        // socket, so solicited shutdown is a message to this task.
        let driver_closed = closed.clone();
        let driver_id = session_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    match result {
                        Ok(()) => {
                            debug!(session = %driver_id, "h2 session ended");
                            let _ = events.send(SessionEvent::Closed);
                        }
                        Err(e) if e.is_go_away() => {
                            debug!(session = %driver_id, "h2 session ended with GOAWAY");
                            let _ = events.send(SessionEvent::Closed);
                        }
                        Err(e) => {
                            warn!(session = %driver_id, error = %e, "h2 session failed");
                            let _ = events.send(SessionEvent::Errored(e.to_string()));
                        }
                    }
                }
                _ = shutdown_rx => {
                    debug!(session = %driver_id, "h2 session shut down");
                    let _ = events.send(SessionEvent::Closed);
                }
            }
            driver_closed.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            session_id,
            send_request: Mutex::new(send_request),
            ping_pong: Mutex::new(ping_pong),
            closed,
            shutdown: std::sync::Mutex::new(Some(shutdown_tx)),
        })
    }

    fn build_uri(path: &str) -> SessionResult<Uri> {
        // h2 requires scheme and authority pseudo-headers; the authority is
        // a placeholder since the peer is fixed by the underlying socket.
        Uri::builder()
            .scheme("https")
            .authority("agent")
            .path_and_query(path)
            .build()
            .map_err(|e| SessionError::Protocol(format!("invalid request path {:?}: {}", path, e)))
    }
}

/// Feed a streamed request body into an h2 send stream, honouring flow
/// control, and finish with END_STREAM.
async fn pipe_request_body(mut send: SendStream<Bytes>, mut body: BodyStream) {
    while let Some(chunk) = body.next().await {
        let mut data = match chunk {
            Ok(data) => data,
            Err(e) => {
                trace!(error = %e, "request body failed, resetting h2 stream");
                send.send_reset(h2::Reason::INTERNAL_ERROR);
                return;
            }
        };

        while !data.is_empty() {
            send.reserve_capacity(data.len());
            match futures::future::poll_fn(|cx| send.poll_capacity(cx)).await {
                Some(Ok(capacity)) => {
                    let frame = data.split_to(capacity.min(data.len()));
                    if send.send_data(frame, false).is_err() {
                        return;
                    }
                }
                Some(Err(_)) | None => return,
            }
        }
    }
    let _ = send.send_data(Bytes::new(), true);
}

/// Wrap an h2 receive stream as a session body stream, releasing
/// flow-control capacity as chunks are consumed.
fn recv_body_stream(recv: RecvStream) -> BodyStream {
    Box::pin(futures::stream::unfold(recv, |mut recv| async move {
        match recv.data().await {
            Some(Ok(data)) => {
                let _ = recv.flow_control().release_capacity(data.len());
                Some((Ok(data), recv))
            }
            Some(Err(e)) => Some((
                Err(SessionError::Connection(format!("h2 receive error: {}", e))),
                recv,
            )),
            None => None,
        }
    }))
}

#[async_trait]
impl TunnelSession for H2Session {
    async fn send_request(&self, request: SessionRequest) -> SessionResult<SessionResponse> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        // Clone to get an independent handle; ready() takes it by value.
        let send_request = self.send_request.lock().await.clone();
        let mut ready = send_request
            .ready()
            .await
            .map_err(|e| SessionError::Connection(format!("h2 session not ready: {}", e)))?;

        let mut h2_request = http::Request::builder()
            .method(request.method)
            .uri(Self::build_uri(&request.path)?)
            .body(())
            .map_err(|e| SessionError::Protocol(format!("invalid request: {}", e)))?;
        h2_request.headers_mut().extend(request.headers);

        let end_of_stream = request.body.is_none();
        let (response, send_stream) = ready
            .send_request(h2_request, end_of_stream)
            .map_err(|e| SessionError::Connection(format!("failed to open h2 stream: {}", e)))?;

        trace!(session = %self.session_id, "opened h2 stream {:?}", send_stream.stream_id());

        if let Some(body) = request.body {
            tokio::spawn(pipe_request_body(send_stream, body));
        }

        let response = response
            .await
            .map_err(|e| SessionError::Connection(format!("h2 request failed: {}", e)))?;

        let (parts, recv_stream) = response.into_parts();
        Ok(SessionResponse {
            status: parts.status,
            headers: parts.headers,
            body: recv_body_stream(recv_stream),
        })
    }

    async fn ping(&self) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        self.ping_pong
            .lock()
            .await
            .ping(Ping::opaque())
            .await
            .map(|_pong| ())
            .map_err(|e| SessionError::Connection(format!("h2 ping failed: {}", e)))
    }

    fn observes_pings(&self) -> bool {
        // The h2 crate acknowledges inbound PING frames internally without
        // surfacing them, so agent-initiated pings cannot be observed here.
        // Transport death still surfaces through the driver task.
        false
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let shutdown = self.shutdown.lock().unwrap().take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> String {
        self.session_id.clone()
    }
}
