//! Agent listener
//!
//! Accepts TLS connections from agents, answers their HTTP/1.1 handshake
//! with a raw status line, and upgrades accepted sockets into multiplexed
//! sessions registered under the agent's identity. The raw status write
//! happens before any session framing, so a rejected agent gets a plain
//! `400`/`409` it can parse with nothing but an HTTP/1.1 client.

use crate::handshake;
use crate::read_ahead::ReadAhead;
use backhaul_broker::{AgentConnection, BrokerConfig, ConnectionRegistry, RegisterOutcome};
use backhaul_session_h2::{H2Session, H2SessionConfig};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const ACCEPT_OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
const REJECT_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
const REJECT_CONFLICT: &[u8] = b"HTTP/1.1 409 Conflict\r\nContent-Length: 0\r\n\r\n";

pub struct AgentAcceptor {
    registry: Arc<ConnectionRegistry>,
    config: Arc<BrokerConfig>,
    h2: H2SessionConfig,
}

impl AgentAcceptor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: Arc<BrokerConfig>,
        h2: H2SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            h2,
        })
    }

    /// Accept loop. Runs until the surrounding task is aborted.
    pub async fn run(self: Arc<Self>, listener: TcpListener, tls: TlsAcceptor) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let acceptor = self.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tls.accept(stream).await {
                            Ok(stream) => acceptor.handle_socket(stream, peer.to_string()).await,
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "TLS handshake failed")
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    }

    /// Drive one agent socket from handshake to registration.
    pub async fn handle_socket<T>(&self, mut io: T, peer: String)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!(peer = %peer, "Agent socket accepted");

        let head = match tokio::time::timeout(
            self.config.request_timeout,
            handshake::read_head(&mut io),
        )
        .await
        {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Bad agent handshake");
                let _ = write_status(&mut io, REJECT_BAD_REQUEST).await;
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "Agent handshake timed out");
                return;
            }
        };
        let (head, remainder) = head;

        let hello = match handshake::parse_head(&head) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejecting agent handshake");
                let _ = write_status(&mut io, REJECT_BAD_REQUEST).await;
                return;
            }
        };

        // A self-reported identity is checked against the registry before
        // the socket is upgraded, so a duplicate is turned away with a
        // status line it can still read.
        if let Some(identity) = hello.identity.as_deref() {
            if !self.registry.offer(identity).await {
                let _ = write_status(&mut io, REJECT_CONFLICT).await;
                return;
            }
        }

        if let Err(e) = write_status(&mut io, ACCEPT_OK).await {
            debug!(peer = %peer, error = %e, "Agent went away before upgrade");
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let io = ReadAhead::new(io, remainder);
        let session = match H2Session::handshake(io, &self.h2, events_tx).await {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Session upgrade failed");
                return;
            }
        };

        let conn = AgentConnection::new(
            Arc::new(session),
            events_rx,
            peer.clone(),
            hello,
            self.config.clone(),
        );

        if let Err(e) = conn.negotiate_identity().await {
            warn!(peer = %peer, error = %e, "Identity negotiation failed");
            conn.stop().await;
            return;
        }

        // The slot may have been claimed between offer and now; register
        // makes the binding decision under the registry lock.
        if self.registry.register(conn.clone()).await == RegisterOutcome::Rejected {
            conn.stop().await;
            return;
        }

        info!(peer = %peer, identity = %conn.identity(), "Agent registered");
    }
}

async fn write_status<T>(io: &mut T, status: &[u8]) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    io.write_all(status).await?;
    io.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_session::mock::MockSession;
    use backhaul_broker::AgentHello;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn acceptor() -> (Arc<AgentAcceptor>, Arc<ConnectionRegistry>) {
        let registry = ConnectionRegistry::new();
        let acceptor = AgentAcceptor::new(
            registry.clone(),
            Arc::new(BrokerConfig::default()),
            H2SessionConfig::default(),
        );
        (acceptor, registry)
    }

    /// Read exactly the status line plus empty headers the broker writes.
    async fn read_status(io: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    /// Emulate the agent side of the multiplexed session: serve identity
    /// and heartbeat requests until the broker hangs up.
    async fn serve_agent(io: DuplexStream, identity: &'static str) {
        let mut conn = match h2::server::handshake(io).await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        while let Some(result) = conn.accept().await {
            let Ok((request, mut respond)) = result else {
                return;
            };
            let path = request.uri().path().to_string();
            match path.as_str() {
                "/agent/kuid" => {
                    let response = http::Response::builder().status(200).body(()).unwrap();
                    if let Ok(mut send) = respond.send_response(response, false) {
                        let _ = send.send_data(Bytes::from_static(identity.as_bytes()), true);
                    }
                }
                "/heartbeat" => {
                    let response = http::Response::builder().status(204).body(()).unwrap();
                    let _ = respond.send_response(response, true);
                }
                _ => {
                    let response = http::Response::builder().status(404).body(()).unwrap();
                    let _ = respond.send_response(response, true);
                }
            }
        }
    }

    async fn wait_for_agent(
        registry: &ConnectionRegistry,
        identity: &str,
    ) -> Arc<AgentConnection> {
        for _ in 0..100 {
            if let Some(conn) = registry.find(identity).await {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {identity} never registered");
    }

    #[tokio::test]
    async fn offered_identity_connects_without_a_fetch() {
        let (acceptor, registry) = acceptor();
        let (mut agent_io, broker_io) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            acceptor
                .handle_socket(broker_io, "10.0.0.1:50000".to_string())
                .await
        });

        agent_io
            .write_all(b"GET /?kuid=abc123&ver=2 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        read_status(&mut agent_io, ACCEPT_OK).await;
        tokio::spawn(serve_agent(agent_io, "abc123"));

        let conn = wait_for_agent(&registry, "abc123").await;
        assert_eq!(conn.identity(), "abc123");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn anonymous_agent_is_asked_for_its_identity() {
        let (acceptor, registry) = acceptor();
        let (mut agent_io, broker_io) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            acceptor
                .handle_socket(broker_io, "10.0.0.1:50000".to_string())
                .await
        });

        agent_io.write_all(b"GET /?ver=2 HTTP/1.1\r\n\r\n").await.unwrap();
        read_status(&mut agent_io, ACCEPT_OK).await;
        tokio::spawn(serve_agent(agent_io, "xyz789"));

        let conn = wait_for_agent(&registry, "xyz789").await;
        assert_eq!(conn.identity(), "xyz789");
    }

    #[tokio::test]
    async fn malformed_handshake_gets_400() {
        let (acceptor, registry) = acceptor();
        let (mut agent_io, broker_io) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            acceptor
                .handle_socket(broker_io, "10.0.0.1:50000".to_string())
                .await
        });

        agent_io
            .write_all(b"POST /upload HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        read_status(&mut agent_io, REJECT_BAD_REQUEST).await;

        // Connection is done after the rejection.
        let mut rest = Vec::new();
        agent_io.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_identity_gets_409_before_upgrade() {
        let (acceptor, registry) = acceptor();

        // A live holder of the identity, backed by a scriptable session.
        let (session, events) = MockSession::new();
        let hello = AgentHello {
            identity: Some("abc123".to_string()),
            ..Default::default()
        };
        let holder = AgentConnection::new(
            session,
            events,
            "10.0.0.2:50000".to_string(),
            hello,
            Arc::new(BrokerConfig::default()),
        );
        holder.negotiate_identity().await.unwrap();
        registry.register(holder.clone()).await;

        let (mut agent_io, broker_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            acceptor
                .handle_socket(broker_io, "10.0.0.1:50000".to_string())
                .await
        });

        agent_io
            .write_all(b"GET /?kuid=abc123 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        read_status(&mut agent_io, REJECT_CONFLICT).await;

        assert!(!holder.is_closed());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn failed_negotiation_leaves_the_registry_empty() {
        let (acceptor, registry) = acceptor();
        let (mut agent_io, broker_io) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            acceptor
                .handle_socket(broker_io, "10.0.0.1:50000".to_string())
                .await
        });

        agent_io.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        read_status(&mut agent_io, ACCEPT_OK).await;

        // Agent answers the identity fetch with 404.
        tokio::spawn(async move {
            let mut conn = match h2::server::handshake(agent_io).await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            while let Some(Ok((_request, mut respond))) = conn.accept().await {
                let response = http::Response::builder().status(404).body(()).unwrap();
                let _ = respond.send_response(response, true);
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.count().await, 0);
    }
}
