use crate::pool::PoolStats;
use crate::provider::Provider;
use crate::registry::RouteRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = response(StatusCode::OK, body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize admin response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

/// What the admin API reads from
struct AdminState {
    registry: Arc<RouteRegistry>,
    providers: Vec<Arc<Provider>>,
    pool_stats: Option<Arc<PoolStats>>,
    auth_token: String,
}

/// Read-only admin API over the live route set
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: AdminState,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<RouteRegistry>,
        providers: Vec<Arc<Provider>>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state: AdminState {
                registry,
                providers,
                pool_stats: None,
                auth_token,
            },
        }
    }

    /// Report the entrypoint's backend traffic under `/v1/stats`
    pub fn with_pool_stats(mut self, stats: Arc<PoolStats>) -> Self {
        self.state.pool_stats = Some(stats);
        self
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener, cancel).await
    }

    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");
        let state = Arc::new(self.state);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = serve_admin_connection(stream, state).await {
                                debug!(addr = %addr, error = %e, "Admin connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept admin connection"),
                },
                _ = cancel.cancelled() => {
                    info!("Admin server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

fn handle_admin_request<B>(req: Request<B>, state: Arc<AdminState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(&serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
        })),

        (&Method::GET, path) if path.starts_with("/v1/") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
            }
            match path {
                "/v1/health" => json_response(&state.registry.health_map()),
                "/v1/routes" => json_response(&state.registry.snapshots()),
                "/v1/stats" => json_response(&serde_json::json!({
                    "routes": state.registry.len(),
                    "providers": state.providers.len(),
                    "entrypoint": state.pool_stats.as_ref().map(|s| s.snapshot()),
                })),
                "/v1/providers" => {
                    let providers: Vec<_> = state.providers.iter().map(|p| p.snapshot()).collect();
                    json_response(&providers)
                }
                "/v1/idlewatchers" => {
                    let mut watchers: Vec<_> = state
                        .registry
                        .idle_watchers()
                        .iter()
                        .map(|w| w.snapshot_debug())
                        .collect();
                    watchers.sort_by(|a, b| a.name.cmp(&b.name));
                    json_response(&watchers)
                }
                _ => response(StatusCode::NOT_FOUND, "not found"),
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Route, RouteConfig};

    fn state() -> Arc<AdminState> {
        let registry = Arc::new(RouteRegistry::new());
        registry
            .register(Route::new(RouteConfig::http("app", "127.0.0.1", 3000)))
            .unwrap();
        Arc::new(AdminState {
            registry,
            providers: Vec::new(),
            pool_stats: None,
            auth_token: "secret".to_string(),
        })
    }

    fn get(path: &str, token: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_health_needs_no_auth() {
        let resp = handle_admin_request(get("/health", None), state()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = handle_admin_request(get("/version", None), state()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_v1_requires_token() {
        let resp = handle_admin_request(get("/v1/routes", None), state()).unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = handle_admin_request(get("/v1/routes", Some("wrong")), state()).unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_v1_endpoints() {
        for path in ["/v1/health", "/v1/routes", "/v1/providers", "/v1/idlewatchers", "/v1/stats"] {
            let resp = handle_admin_request(get(path, Some("secret")), state()).unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{}", path);
            assert_eq!(resp.headers()["content-type"], "application/json");
        }
        let resp = handle_admin_request(get("/v1/nope", Some("secret")), state()).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_routes_listing() {
        use http_body_util::BodyExt;

        let resp = handle_admin_request(get("/v1/routes", Some("secret")), state()).unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let routes: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(routes[0]["alias"], "app");
        assert_eq!(routes[0]["target"], "127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_stats_report_entrypoint_traffic() {
        use http_body_util::BodyExt;

        let stats = Arc::new(PoolStats::default());
        stats.record_request();
        stats.record_request();
        stats.record_failure();
        let server = AdminServer::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::clone(&state().registry),
            Vec::new(),
            "secret".to_string(),
        )
        .with_pool_stats(stats);

        let resp = handle_admin_request(get("/v1/stats", Some("secret")), Arc::new(server.state)).unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["routes"], 1);
        assert_eq!(stats["entrypoint"]["total_requests"], 2);
        assert_eq!(stats["entrypoint"]["failed_requests"], 1);

        let resp = handle_admin_request(get("/v1/stats", Some("secret")), state()).unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(stats["entrypoint"].is_null());
    }
}
