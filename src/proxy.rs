//! HTTP entrypoint
//!
//! One shared listener for every `http` route. The route is picked from the
//! `Host` header; napping backends are woken before the request is forwarded
//! through the connection pool.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::idlewatcher::ActivityGuard;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::registry::RouteRegistry;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Shared state of every entrypoint connection
struct Entrypoint {
    registry: Arc<RouteRegistry>,
    pool: ConnectionPool,
    request_timeout: Duration,
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    entrypoint: Arc<Entrypoint>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<RouteRegistry>,
        pool_config: PoolConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            bind_addr,
            entrypoint: Arc::new(Entrypoint {
                registry,
                pool: ConnectionPool::new(pool_config),
                request_timeout,
            }),
        }
    }

    /// Counters of requests forwarded to backends
    pub fn pool_stats(&self) -> Arc<PoolStats> {
        self.entrypoint.pool.stats()
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Entrypoint listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let entrypoint = Arc::clone(&self.entrypoint);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, entrypoint).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = cancel.cancelled() => {
                    info!("Entrypoint shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, entrypoint: Arc<Entrypoint>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let entrypoint = Arc::clone(&entrypoint);
        async move { handle_request(req, entrypoint, addr).await }
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

async fn handle_request(
    mut req: Request<Incoming>,
    entrypoint: Arc<Entrypoint>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(hostname) = extract_hostname(&req) else {
        return Ok(json_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    // X-Forwarded-* are overwritten, never appended: this proxy is the first trusted hop.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let Some(route) = entrypoint.registry.find_http(&hostname) else {
        return Ok(json_error_response(
            ProxyErrorCode::UnknownHost,
            "Unknown or unconfigured host",
        ));
    };
    let alias = route.alias().to_string();
    let target = route.config().target();

    let activity = match route.idle_watcher() {
        Some(watcher) => {
            if !watcher.may_wake(req.uri().path()) {
                return Ok(json_error_response(
                    ProxyErrorCode::WakeRefused,
                    "Backend is napping and this path may not wake it",
                ));
            }
            let activity = watcher.activity();
            if let Err(e) = watcher.wake().await {
                warn!(alias, error = %e, "Failed to wake backend");
                return Ok(json_error_response(ProxyErrorCode::from(&e), e.to_string()));
            }
            Some(activity)
        }
        None => None,
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, alias, target, request_id, activity).await;
    }

    let result = tokio::time::timeout(
        entrypoint.request_timeout,
        entrypoint.pool.send_request(req, &target),
    )
    .await;
    drop(activity);

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(alias, target, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                alias,
                target,
                timeout_secs = entrypoint.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    entrypoint.request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }
            // Alphanumeric, hyphen, underscore and dot only; keeps logs clean
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            {
                return None;
            }
            Some(hostname.to_lowercase())
        })
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the backend
fn build_upgrade_request<B>(req: &Request<B>, target: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("Host: {}\r\n\r\n", target));

    request.into_bytes()
}

/// Status and headers of the backend's answer to an upgrade
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
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

/// Bodiless response carrying the backend's status and headers
fn upgrade_response(status: StatusCode, headers: &[(String, String)]) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    for (name, value) in headers {
        if status == StatusCode::SWITCHING_PROTOCOLS
            && (name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding"))
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Read up to and including the blank line ending a response head. Bytes
/// the backend sent after it are returned separately.
async fn read_response_head<R>(reader: &mut R) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "backend closed connection"));
        }
        let search_from = head.len().saturating_sub(3);
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = head[search_from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = head.split_off(search_from + pos + 4);
            return Ok((head, rest));
        }
        if head.len() > MAX_UPGRADE_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "upgrade response head too large"));
        }
    }
}

async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    early: Vec<u8>,
    alias: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(alias, request_id, error = %e, "Upgraded connection closed before relay");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(alias, request_id, client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(alias, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Relay a protocol upgrade (e.g. WebSocket). The idle watcher's activity
/// guard is held until the upgraded connection closes.
async fn handle_upgrade(
    req: Request<Incoming>,
    alias: String,
    target: String,
    request_id: String,
    activity: Option<ActivityGuard>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let raw_request = build_upgrade_request(&req, &target);

    let mut backend_stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(alias, target, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(alias, error = %e, "Failed to send upgrade request to backend");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to send upgrade request",
        ));
    }

    let (head, early) = match read_response_head(&mut backend_stream).await {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Backend closed connection",
            ));
        }
        Err(e) => {
            error!(alias, error = %e, "Failed to read upgrade response from backend");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to read backend response",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from backend",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(alias, status = %status, "Backend rejected upgrade request");
        return Ok(upgrade_response(status, &response_headers));
    }

    debug!(alias, request_id, "Upgrade accepted by backend");
    tokio::spawn(async move {
        let _activity = activity;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => forward_bidirectional(upgraded, backend_stream, early, &alias, &request_id).await,
            Err(e) => error!(alias, error = %e, "Failed to upgrade client connection"),
        }
    });

    Ok(upgrade_response(StatusCode::SWITCHING_PROTOCOLS, &response_headers))
}
