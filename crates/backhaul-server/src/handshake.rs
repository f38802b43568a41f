//! Agent handshake parsing
//!
//! An agent opens its TLS connection with a single plain HTTP/1.1 request
//! head, `GET /[?kuid=..&ver=..&hbSeconds=..] HTTP/1.1`, and then waits for
//! a raw status line before speaking the multiplexed protocol. This module
//! reads and parses that head; anything read past the terminating blank
//! line is handed back so it can be replayed into the session handshake.

use backhaul_broker::AgentHello;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the handshake head. Real heads are one short line.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Malformed request head")]
    Malformed,

    #[error("Unsupported method {0:?}")]
    Method(String),

    #[error("Unsupported request path {0:?}")]
    Path(String),

    #[error("Unsupported protocol version {0:?}")]
    Version(String),

    #[error("Request head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,

    #[error("Connection closed during handshake")]
    Eof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one HTTP/1.1 request head off `io`. Returns the head text and any
/// bytes that arrived after it.
pub async fn read_head<T>(io: &mut T) -> Result<(String, Bytes), HandshakeError>
where
    T: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = buf.split_to(end + 4);
            let head = std::str::from_utf8(&head)
                .map_err(|_| HandshakeError::Malformed)?
                .to_string();
            return Ok((head, buf.freeze()));
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(HandshakeError::TooLarge);
        }
        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(HandshakeError::Eof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse an agent handshake head. Only `GET / HTTP/1.1` (with an optional
/// query string) is an agent handshake; anything else is rejected.
pub fn parse_head(head: &str) -> Result<AgentHello, HandshakeError> {
    let request_line = head.lines().next().ok_or(HandshakeError::Malformed)?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(HandshakeError::Malformed)?;
    let target = parts.next().ok_or(HandshakeError::Malformed)?;
    let version = parts.next().ok_or(HandshakeError::Malformed)?;
    if parts.next().is_some() || target.is_empty() {
        return Err(HandshakeError::Malformed);
    }

    if method != "GET" {
        return Err(HandshakeError::Method(method.to_string()));
    }
    if version != "HTTP/1.1" {
        return Err(HandshakeError::Version(version.to_string()));
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    if path != "/" {
        return Err(HandshakeError::Path(path.to_string()));
    }

    Ok(parse_query(query))
}

fn parse_query(query: &str) -> AgentHello {
    let mut hello = AgentHello::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "kuid" if !value.is_empty() => hello.identity = Some(value.into_owned()),
            "ver" if !value.is_empty() => hello.version = Some(value.into_owned()),
            // An unparseable interval is the same as not declaring one.
            "hbSeconds" => hello.heartbeat_seconds = value.parse().ok(),
            _ => {}
        }
    }
    hello
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn bare_handshake_parses_to_empty_hello() {
        let hello = parse_head("GET / HTTP/1.1\r\nHost: broker\r\n\r\n").unwrap();
        assert!(hello.identity.is_none());
        assert!(hello.version.is_none());
        assert!(hello.heartbeat_seconds.is_none());
    }

    #[test]
    fn full_query_is_extracted() {
        let hello =
            parse_head("GET /?kuid=abc123&ver=2&hbSeconds=30 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(hello.identity.as_deref(), Some("abc123"));
        assert_eq!(hello.version.as_deref(), Some("2"));
        assert_eq!(hello.heartbeat_seconds, Some(30));
    }

    #[test]
    fn percent_encoded_values_are_decoded() {
        let hello = parse_head("GET /?kuid=a%2Fb HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(hello.identity.as_deref(), Some("a/b"));
    }

    #[test]
    fn empty_and_unknown_parameters_are_ignored() {
        let hello = parse_head("GET /?kuid=&ver=&foo=bar HTTP/1.1\r\n\r\n").unwrap();
        assert!(hello.identity.is_none());
        assert!(hello.version.is_none());
    }

    #[test]
    fn unparseable_interval_is_dropped() {
        let hello = parse_head("GET /?hbSeconds=soon HTTP/1.1\r\n\r\n").unwrap();
        assert!(hello.heartbeat_seconds.is_none());
    }

    #[test]
    fn non_get_is_rejected() {
        let result = parse_head("POST / HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(HandshakeError::Method(_))));
    }

    #[test]
    fn non_root_path_is_rejected() {
        let result = parse_head("GET /agents/abc HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(HandshakeError::Path(_))));
    }

    #[test]
    fn wrong_http_version_is_rejected() {
        let result = parse_head("GET / HTTP/1.0\r\n\r\n");
        assert!(matches!(result, Err(HandshakeError::Version(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_head("not an http request"),
            Err(HandshakeError::Malformed)
        ));
    }

    #[tokio::test]
    async fn read_head_returns_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: broker\r\n\r\nEXTRA")
            .await
            .unwrap();

        let (head, remainder) = read_head(&mut server).await.unwrap();
        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(remainder, Bytes::from_static(b"EXTRA"));
    }

    #[tokio::test]
    async fn read_head_fails_on_early_close() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        let result = read_head(&mut server).await;
        assert!(matches!(result, Err(HandshakeError::Eof)));
    }

    #[tokio::test]
    async fn read_head_enforces_the_size_cap() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let big = vec![b'a'; MAX_HEAD_BYTES + 1];
        client.write_all(&big).await.unwrap();

        let result = read_head(&mut server).await;
        assert!(matches!(result, Err(HandshakeError::TooLarge)));
    }
}
