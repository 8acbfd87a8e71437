//! Raw byte tunnel for upgrade requests (WebSocket and friends).
//!
//! The client connection is detached from hyper by taking its [`OnUpgrade`]
//! handle out of the request. The request head is replayed on a fresh
//! transport connection to the origin, the origin's response head is passed
//! back to the client, and from then on bytes are relayed verbatim in both
//! directions until either side finishes.

use crate::common::{empty, BoxError, ProxyBody, TlsConfig};
use crate::dispatcher::ProxyTarget;
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;

/// Any bidirectional byte stream the tunnel can own.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

pub type BoxedStream = Box<dyn RawStream>;

pub struct TunnelForwarder {
    connect_timeout: Duration,
    max_header_size: usize,
    tls: tokio_native_tls::TlsConnector,
    metrics: ProxyMetrics,
}

impl TunnelForwarder {
    pub fn new(
        connect_timeout: Duration,
        max_header_size: usize,
        verify_certs: bool,
        metrics: ProxyMetrics,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            connect_timeout,
            max_header_size,
            tls: TlsConfig::client_connector(verify_certs)?,
            metrics,
        })
    }

    /// Runs the handshake against `target` and, when the origin switches
    /// protocols, spawns the relay session. The returned response is what
    /// the client sees for the handshake itself.
    pub async fn forward<B>(
        &self,
        mut req: Request<B>,
        target: Arc<ProxyTarget>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let client = detach(&mut req)?;
        let head = encode_request_head(&req);
        drop(req);

        let mut origin = self.connect(&target).await?;

        origin.write_all(&head).await.map_err(|e| {
            ProxyError::tunnel(target.to_string(), format!("request header copy error={}", e))
        })?;

        let handshake = read_response_head(&mut origin, self.max_header_size)
            .await
            .map_err(|e| ProxyError::tunnel(target.to_string(), format!("handshake error={}", e)))?;

        if handshake.status != StatusCode::SWITCHING_PROTOCOLS {
            debug!("{} declined upgrade with {}", target, handshake.status);
            return Ok(declined_response(handshake, origin));
        }

        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = handshake.headers;
        response.headers_mut().remove(CONTENT_LENGTH);
        response.headers_mut().remove(TRANSFER_ENCODING);

        let guard = self.metrics.tunnel_opened();
        let leftover = handshake.leftover;
        tokio::spawn(async move {
            let _guard = guard;
            run_session(client, origin, leftover, &target).await;
        });

        Ok(response)
    }

    async fn connect(&self, target: &ProxyTarget) -> Result<BoxedStream, ProxyError> {
        let (host, port) = target.connect_addr();

        let tcp = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| {
                ProxyError::tunnel(
                    target.to_string(),
                    format!("dial error=timed out after {:?}", self.connect_timeout),
                )
            })?
            .map_err(|e| ProxyError::tunnel(target.to_string(), format!("dial error={}", e)))?;
        let _ = tcp.set_nodelay(true);

        if !target.is_tls() {
            return Ok(Box::new(tcp));
        }

        let tls = self
            .tls
            .connect(&host, tcp)
            .await
            .map_err(|e| ProxyError::tunnel(target.to_string(), format!("tls error={}", e)))?;
        Ok(Box::new(tls))
    }
}

/// Takes exclusive ownership of the client connection's upgrade handle.
/// After this the request can no longer be upgraded by anyone else.
pub fn detach<B>(req: &mut Request<B>) -> Result<OnUpgrade, ProxyError> {
    req.extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| ProxyError::Hijack("connection does not support upgrades".to_string()))
}

/// Serializes the request line and headers as HTTP/1.1.
pub fn encode_request_head<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(path.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// The origin's answer to a replayed upgrade request.
#[derive(Debug)]
pub struct Handshake {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Bytes read past the end of the head.
    pub leftover: Vec<u8>,
}

/// Reads one response head from `stream`, refusing heads larger than `limit`.
pub async fn read_response_head<S>(stream: &mut S, limit: usize) -> io::Result<Handshake>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
        }
        // Never read more than one byte past the limit.
        let want = (limit + 1 - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "origin closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let leftover = buf.split_off(head_end);
    let (status, headers) = parse_response_head(&buf)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed response head"))?;

    Ok(Handshake {
        status,
        headers,
        leftover,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_response_head(head: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_bytes(parts.next()?.as_bytes()).ok()?;

    let mut headers = HeaderMap::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }

    Some((status, headers))
}

/// Passes a non-101 answer through as an ordinary response. The body is
/// streamed when the origin declared its length.
fn declined_response(handshake: Handshake, origin: BoxedStream) -> Response<ProxyBody> {
    let Handshake {
        status,
        mut headers,
        leftover,
    } = handshake;

    let length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    for name in ["connection", "upgrade", "keep-alive", "transfer-encoding"] {
        headers.remove(name);
    }

    let body = match length {
        Some(length) if length > 0 => {
            let mut prefix = Bytes::from(leftover);
            if prefix.len() as u64 > length {
                prefix.truncate(length as usize);
            }
            let remaining = length - prefix.len() as u64;
            let chunks = stream::once(async move { Ok::<_, io::Error>(prefix) })
                .chain(ReaderStream::new(origin.take(remaining)))
                .map_ok(Frame::data);
            BodyExt::map_err(StreamBody::new(chunks), |e| -> BoxError { Box::new(e) }).boxed_unsync()
        }
        _ => {
            headers.remove(CONTENT_LENGTH);
            empty()
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn run_session(client: OnUpgrade, mut origin: BoxedStream, leftover: Vec<u8>, target: &ProxyTarget) {
    let upgraded = match client.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            error!("proxy raw, hijack error={}, url={}", e, target);
            let _ = origin.shutdown().await;
            return;
        }
    };
    let mut client = TokioIo::new(upgraded);

    if !leftover.is_empty() {
        if let Err(e) = client.write_all(&leftover).await {
            error!("proxy raw, copy body error={}, url={}", e, target);
            return;
        }
    }

    info!("Tunnel opened to {}", target);
    let outcome = relay(client, origin).await;
    match session_diagnostic(&outcome, target) {
        Some(line) => error!("{}", line),
        None => debug!("Tunnel to {} closed ({} finished first)", target, outcome.direction),
    }
}

/// The error line for a finished session, if it ended badly. End of stream
/// on either side is a normal close.
fn session_diagnostic(outcome: &RelayOutcome, target: &ProxyTarget) -> Option<String> {
    match &outcome.result {
        Ok(_) => None,
        Err(e) => Some(format!(
            "proxy raw, copy body error={} ({}), url={}",
            e, outcome.direction, target
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToOrigin,
    OriginToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToOrigin => write!(f, "client->origin"),
            Direction::OriginToClient => write!(f, "origin->client"),
        }
    }
}

/// How a relay ended: the first direction to finish and its result.
#[derive(Debug)]
pub struct RelayOutcome {
    pub direction: Direction,
    pub result: io::Result<u64>,
}

impl RelayOutcome {
    pub fn is_clean(&self) -> bool {
        self.result.is_ok()
    }
}

/// Reports a copy loop's end on the session channel exactly once, even when
/// the loop is aborted or panics.
struct Completion {
    direction: Direction,
    tx: Option<mpsc::Sender<RelayOutcome>>,
}

impl Completion {
    fn new(direction: Direction, tx: mpsc::Sender<RelayOutcome>) -> Self {
        Self {
            direction,
            tx: Some(tx),
        }
    }

    fn report(mut self, result: io::Result<u64>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(RelayOutcome {
                direction: self.direction,
                result,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(RelayOutcome {
                direction: self.direction,
                result: Err(io::Error::other("relay stopped without reporting")),
            });
        }
    }
}

async fn copy_one_way<R, W>(mut reader: R, mut writer: W, completion: Completion)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::io::copy(&mut reader, &mut writer).await;
    if result.is_ok() {
        let _ = writer.shutdown().await;
    }
    completion.report(result);
}

/// Copies bytes both ways until the first direction finishes, then closes
/// both streams. End of stream counts as a clean finish.
pub async fn relay<C, O>(client: C, origin: O) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (origin_read, origin_write) = tokio::io::split(origin);
    let (done_tx, mut done_rx) = mpsc::channel(2);

    let upstream = tokio::spawn(copy_one_way(
        client_read,
        origin_write,
        Completion::new(Direction::ClientToOrigin, done_tx.clone()),
    ));
    let downstream = tokio::spawn(copy_one_way(
        origin_read,
        client_write,
        Completion::new(Direction::OriginToClient, done_tx),
    ));

    let outcome = match done_rx.recv().await {
        Some(outcome) => outcome,
        None => RelayOutcome {
            direction: Direction::ClientToOrigin,
            result: Err(io::Error::other("relay tasks exited without reporting")),
        },
    };

    // Dropping the halves held by both tasks closes both connections.
    upstream.abort();
    downstream.abort();
    let _ = upstream.await;
    let _ = downstream.await;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::full;
    use tokio::io::duplex;

    #[test]
    fn test_encode_request_head() {
        let req = Request::builder()
            .method("GET")
            .uri("/socket?room=1")
            .header("host", "backend:3000")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        let head = String::from_utf8(encode_request_head(&req)).unwrap();
        assert_eq!(
            head,
            "GET /socket?room=1 HTTP/1.1\r\nhost: backend:3000\r\nconnection: Upgrade\r\nupgrade: websocket\r\n\r\n"
        );
    }

    #[test]
    fn test_detach_without_upgrade_support() {
        let mut req = Request::builder().uri("/socket").body(full("")).unwrap();
        let err = detach(&mut req).unwrap_err();
        assert!(matches!(err, ProxyError::Hijack(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_leftover() {
        let (mut origin, mut proxy_side) = duplex(4096);
        origin
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x81\x02hi")
            .await
            .unwrap();

        let handshake = read_response_head(&mut proxy_side, 16 * 1024).await.unwrap();
        assert_eq!(handshake.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(handshake.headers["upgrade"], "websocket");
        assert_eq!(handshake.leftover, b"\x81\x02hi");
    }

    #[tokio::test]
    async fn test_read_response_head_limits() {
        let (mut origin, mut proxy_side) = duplex(64 * 1024);
        origin.write_all(&vec![b'a'; 4096]).await.unwrap();
        let err = read_response_head(&mut proxy_side, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let (mut origin, mut proxy_side) = duplex(1024);
        origin.write_all(b"HTTP/1.1 101 Swit").await.unwrap();
        drop(origin);
        let err = read_response_head(&mut proxy_side, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_relay_clean_close() {
        let (mut client, client_proxy) = duplex(1024);
        let (mut origin, origin_proxy) = duplex(1024);
        let session = tokio::spawn(relay(client_proxy, origin_proxy));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong").await.unwrap();
        drop(origin);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"pong");

        let outcome = session.await.unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.direction, Direction::OriginToClient);
        assert_eq!(outcome.result.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_read_response_head_stops_at_limit() {
        let (mut origin, mut proxy_side) = duplex(64 * 1024);
        origin.write_all(&vec![b'a'; 300]).await.unwrap();
        drop(origin);

        let err = read_response_head(&mut proxy_side, 100).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Only limit + 1 bytes were consumed.
        let mut rest = Vec::new();
        proxy_side.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 199);
    }

    #[tokio::test]
    async fn test_read_response_head_at_limit_keeps_leftover() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        let (mut origin, mut proxy_side) = duplex(1024);
        origin.write_all(head).await.unwrap();
        origin.write_all(b"frame").await.unwrap();

        let handshake = read_response_head(&mut proxy_side, head.len()).await.unwrap();
        assert_eq!(handshake.status, StatusCode::SWITCHING_PROTOCOLS);

        // Bytes past the head that were not read yet stay on the stream.
        let mut rest = handshake.leftover;
        drop(origin);
        proxy_side.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"frame");
    }

    fn target() -> ProxyTarget {
        ProxyTarget::parse("http://backend:3000", Some("api".to_string())).unwrap()
    }

    #[test]
    fn test_clean_session_has_no_diagnostic() {
        let outcome = RelayOutcome {
            direction: Direction::OriginToClient,
            result: Ok(42),
        };
        assert_eq!(session_diagnostic(&outcome, &target()), None);
    }

    #[test]
    fn test_reset_session_names_the_target() {
        let outcome = RelayOutcome {
            direction: Direction::OriginToClient,
            result: Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        };
        let line = session_diagnostic(&outcome, &target()).unwrap();
        assert!(line.starts_with("proxy raw, copy body error="), "{}", line);
        assert!(line.contains("origin->client"), "{}", line);
        assert!(line.ends_with("url=api(http://backend:3000/)"), "{}", line);
    }

    #[tokio::test]
    async fn test_origin_reset_during_relay_yields_one_diagnostic() {
        let (_client, client_proxy) = duplex(1024);
        let origin = ResettingOrigin {
            payload: Some(&b"partial"[..]),
        };
        let outcome = relay(client_proxy, origin).await;
        assert!(session_diagnostic(&outcome, &target()).is_some());
    }

    /// Origin that delivers a few bytes and then resets.
    struct ResettingOrigin {
        payload: Option<&'static [u8]>,
    }

    impl AsyncRead for ResettingOrigin {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.payload.take() {
                Some(payload) => {
                    buf.put_slice(payload);
                    std::task::Poll::Ready(Ok(()))
                }
                None => std::task::Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset))),
            }
        }
    }

    impl AsyncWrite for ResettingOrigin {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_relay_origin_reset() {
        let (mut client, client_proxy) = duplex(1024);
        let origin = ResettingOrigin {
            payload: Some(&b"partial"[..]),
        };

        let outcome = relay(client_proxy, origin).await;
        assert!(!outcome.is_clean());
        assert_eq!(outcome.direction, Direction::OriginToClient);
        assert_eq!(
            outcome.result.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );

        // The client leg is closed once the relay returns.
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"partial");
    }

    #[tokio::test]
    async fn test_relays_are_isolated() {
        let (mut client_a, proxy_a) = duplex(1024);
        let (mut origin_a, upstream_a) = duplex(1024);
        let (mut client_b, proxy_b) = duplex(1024);
        let (mut origin_b, upstream_b) = duplex(1024);

        let session_a = tokio::spawn(relay(proxy_a, upstream_a));
        let session_b = tokio::spawn(relay(proxy_b, upstream_b));

        client_a.write_all(b"aaaa").await.unwrap();
        client_b.write_all(b"bbbb").await.unwrap();

        let mut buf = [0u8; 4];
        origin_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"aaaa");
        origin_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bbbb");

        // Closing tunnel A leaves tunnel B relaying.
        drop(origin_a);
        let outcome = session_a.await.unwrap();
        assert!(outcome.is_clean());

        origin_b.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
        assert!(!session_b.is_finished());

        drop(client_b);
        let outcome = session_b.await.unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.direction, Direction::ClientToOrigin);
    }
}
