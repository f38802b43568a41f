//! Public request router
//!
//! Serves the external HTTP surface: `/count` reports how many agents are
//! registered, and `/agents/<identity>/<path>` proxies the request over the
//! agent's tunnel session. Bodies stream through in both directions without
//! buffering; the registry lock is held only for the identity lookup, never
//! across the proxied exchange.

use backhaul_broker::ConnectionRegistry;
use backhaul_session::{BodyStream, SessionError, SessionRequest};
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

type ProxyBody = UnsyncBoxBody<Bytes, SessionError>;

/// Hop-by-hop headers that must not cross the proxy, plus `host`, which
/// belongs to the outer connection.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Where a public request path leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    NotFound,
    Count,
    Agent { identity: String, subpath: String },
}

/// Resolve a public request path. Trailing slashes are insignificant; the
/// portion after the identity is forwarded to the agent, defaulting to `/`.
pub fn route(path: &str) -> RouteTarget {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return RouteTarget::NotFound;
    }
    if trimmed == "/count" {
        return RouteTarget::Count;
    }

    let Some(rest) = trimmed.strip_prefix("/agents/") else {
        return RouteTarget::NotFound;
    };
    let (identity, subpath) = match rest.split_once('/') {
        Some((identity, subpath)) => (identity, format!("/{subpath}")),
        None => (rest, "/".to_string()),
    };
    if identity.is_empty() {
        return RouteTarget::NotFound;
    }

    RouteTarget::Agent {
        identity: identity.to_string(),
        subpath,
    }
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !STRIPPED_HEADERS.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn fixed_body(body: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(body.as_bytes()))
        .map_err(|e| match e {})
        .boxed_unsync()
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(fixed_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain"),
    );
    response
}

pub struct PublicRouter {
    registry: Arc<ConnectionRegistry>,
}

impl PublicRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// Accept loop for the public listener. Runs until the surrounding task
    /// is aborted.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let router = self.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |request: Request<Incoming>| {
                            let router = router.clone();
                            async move { Ok::<_, Infallible>(router.handle(request).await) }
                        });
                        let result = auto::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "Public connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    }

    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        match route(request.uri().path()) {
            RouteTarget::NotFound => plain_response(StatusCode::NOT_FOUND, "Not found\n"),
            RouteTarget::Count => self.count().await,
            RouteTarget::Agent { identity, subpath } => {
                self.proxy(&identity, subpath, request).await
            }
        }
    }

    async fn count(&self) -> Response<ProxyBody> {
        let count = self.registry.count().await;
        let body = serde_json::json!({ "count": count }).to_string();
        let mut response = Response::new(
            Full::new(Bytes::from(body))
                .map_err(|e| match e {})
                .boxed_unsync(),
        );
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        response
    }

    async fn proxy<B>(
        &self,
        identity: &str,
        subpath: String,
        request: Request<B>,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let Some(conn) = self.registry.find(identity).await else {
            debug!(identity, "Request for unknown agent");
            return plain_response(StatusCode::GONE, "Unknown agent\n");
        };

        let (parts, body) = request.into_parts();
        let mut path = subpath;
        if let Some(query) = parts.uri.query() {
            path = format!("{path}?{query}");
        }

        let inbound: BodyStream = Box::pin(
            body.into_data_stream()
                .map(|chunk| chunk.map_err(|e| SessionError::Connection(e.to_string()))),
        );

        let mut tunnel_request = SessionRequest::new(parts.method.clone(), path.clone());
        tunnel_request.headers = end_to_end_headers(&parts.headers);
        let tunnel_request = tunnel_request.with_streamed_body(inbound);

        debug!(
            identity,
            method = %parts.method,
            path = %path,
            "Proxying request to agent"
        );

        match conn.session().send_request(tunnel_request).await {
            Ok(response) => {
                let mut out = Response::new(
                    StreamBody::new(response.body.map(|chunk| chunk.map(Frame::data)))
                        .boxed_unsync(),
                );
                *out.status_mut() = response.status;
                *out.headers_mut() = end_to_end_headers(&response.headers);
                out
            }
            Err(e) => {
                warn!(identity, error = %e, "Agent exchange failed");
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Agent transport error\n")
            }
        }
    }
}
