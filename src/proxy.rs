use crate::error::{json_error_response, ProxyErrorCode, RouteError};
use crate::pool::ConnectionPool;
use crate::registry::Instance;
use crate::router::{RouteTarget, Router};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest backend handshake response accepted for an upgrade
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Per-listener state shared by every connection
struct ProxyContext {
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    is_tls: bool,
}

/// Front-end listener forwarding requests to the instance the router picks
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<Router>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            pool,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let ctx = Arc::new(ProxyContext {
            router: Arc::clone(&self.router),
            pool: Arc::clone(&self.pool),
            is_tls: tls_acceptor.is_some(),
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&ctx);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, ctx).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Route and forward one request.
///
/// Plain requests always get an HTTP response. For upgrade requests a
/// routing failure is returned as `Err`, which makes hyper drop the
/// connection without answering.
async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, RouteError> {
    let upgrade = is_upgrade_request(&req);

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None if upgrade => return Err(RouteError::MissingHost),
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    set_forwarding_headers(&mut req, &request_id, client_addr, ctx.is_tls);

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, upgrade, "Incoming request");

    let target = match ctx.router.route(&hostname, ctx.is_tls).await {
        Ok(target) => target,
        Err(e) if upgrade => {
            warn!(hostname, request_id, error = %e, "Closing upgrade connection");
            return Err(e);
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "Routing failed");
            return Ok(e.into_response());
        }
    };

    if upgrade {
        return handle_upgrade(req, ctx, hostname, target, request_id).await;
    }

    match ctx.pool.send_request(req, &target.instance).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(hostname, instance = %target.instance, request_id, error = %e, "Failed to forward request");
            ctx.router.evict(&target.app_id, &target.instance).await;
            Ok(RouteError::TransportFailure(hostname).into_response())
        }
    }
}

/// Overwrite X-Forwarded-* rather than append; this proxy is the first trusted hop
fn set_forwarding_headers<B>(req: &mut Request<B>, request_id: &str, client_addr: SocketAddr, is_tls: bool) {
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Hostname from the Host header (or the HTTP/2 authority), port stripped and lowercased
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let hostname = raw.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // alphanumeric, hyphen and dot only; keeps logs clean
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// Check if a request asks for a protocol upgrade (WebSocket and friends)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Serialize the upgrade request for the backend, keeping the client's Host
fn build_upgrade_request<B>(req: &Request<B>, instance: &Instance) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    if !req.headers().contains_key(hyper::header::HOST) {
        request.push_str(&format!("host: {}\r\n", instance));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's status line and headers
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(head).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read the handshake response head; bytes past the head are returned separately
async fn read_response_head<S>(stream: &mut S) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "upgrade response head too large"));
        }
    }
}

/// Open the backend side of an upgrade and run the handshake
async fn backend_handshake(
    raw_request: &[u8],
    instance: &Instance,
) -> io::Result<(TcpStream, StatusCode, Vec<(String, String)>, Vec<u8>)> {
    let mut backend = TcpStream::connect((instance.host.as_str(), instance.port)).await?;
    backend.write_all(raw_request).await?;

    let (head, rest) = read_response_head(&mut backend).await?;
    let (status, headers) = parse_upgrade_response(&head)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid upgrade response from backend"))?;

    Ok((backend, status, headers, rest))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    hostname: String,
    target: RouteTarget,
    request_id: String,
) -> Result<ProxyResponse, RouteError> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(hostname, request_id, upgrade_type, instance = %target.instance, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &target.instance);

    let (backend, status, response_headers, early_data) =
        match backend_handshake(&raw_request, &target.instance).await {
            Ok(handshake) => handshake,
            Err(e) => {
                error!(hostname, instance = %target.instance, request_id, error = %e, "Upgrade to backend failed");
                ctx.router.evict(&target.app_id, &target.instance).await;
                return Err(RouteError::TransportFailure(hostname));
            }
        };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(hostname, request_id, upgrade_type, instance = %target.instance, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    let instance = target.instance;
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                relay(upgraded, backend, early_data, &hostname, &instance, &request_id).await;
            }
            Err(e) => {
                error!(hostname, request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Relay bytes both ways until either side closes
async fn relay(
    client: Upgraded,
    mut backend: TcpStream,
    early_data: Vec<u8>,
    hostname: &str,
    instance: &Instance,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(hostname, request_id, error = %e, "Client went away during upgrade");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                hostname,
                request_id,
                %instance,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(hostname, request_id, %instance, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/chat?room=1");
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(extract_hostname(&request(Some("X.Test:31415"))), Some("x.test".into()));
        assert_eq!(extract_hostname(&request(Some("x.test"))), Some("x.test".into()));
        assert_eq!(extract_hostname(&request(None)), None);
        assert_eq!(extract_hostname(&request(Some("bad host"))), None);
        assert_eq!(extract_hostname(&request(Some(""))), None);
        assert_eq!(extract_hostname(&request(Some("a".repeat(300).as_str()))), None);
    }

    #[test]
    fn test_extract_hostname_from_authority() {
        let req = Request::builder()
            .uri("http://Api.Test:8080/x")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req), Some("api.test".into()));
    }

    #[test]
    fn test_is_upgrade_request() {
        let ws = Request::builder()
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&ws));

        let no_upgrade_header = Request::builder().header("connection", "upgrade").body(()).unwrap();
        assert!(!is_upgrade_request(&no_upgrade_header));
        assert!(!is_upgrade_request(&request(Some("x.test"))));
    }

    #[test]
    fn test_forwarding_headers_overwrite_client_values() {
        let mut req = Request::builder()
            .header("host", "x.test")
            .header("x-forwarded-for", "6.6.6.6")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();
        let addr: SocketAddr = "192.168.1.9:50000".parse().unwrap();

        set_forwarding_headers(&mut req, "req-1", addr, false);

        let headers = req.headers();
        assert_eq!(headers[X_REQUEST_ID], "req-1");
        assert_eq!(headers[X_FORWARDED_FOR], "192.168.1.9");
        assert_eq!(headers[X_FORWARDED_HOST], "x.test");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn test_build_upgrade_request_keeps_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/ws")
            .header("host", "x.test")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req, &Instance::new("10.0.0.2", 8001))).unwrap();

        assert!(raw.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(raw.contains("host: x.test\r\n"));
        assert!(!raw.contains("10.0.0.2"));
        assert!(raw.ends_with("\r\n\r\n"));

        let no_host = Request::builder().uri("/ws").body(()).unwrap();
        let raw = String::from_utf8(build_upgrade_request(&no_host, &Instance::new("10.0.0.2", 8001))).unwrap();
        assert!(raw.contains("host: 10.0.0.2:8001\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
        assert!(parse_upgrade_response(b"HTTP/1.1 abc\r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn test_read_response_head_splits_early_data() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 101 Switching Protocols\r\n").await.unwrap();
            server.write_all(b"Upgrade: echo\r\n\r\nhello").await.unwrap();
        });

        let (head, rest) = read_response_head(&mut client).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_read_response_head_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let err = read_response_head(&mut client).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
