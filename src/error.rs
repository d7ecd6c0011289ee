//! Error types and JSON error responses for the entrypoint

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to start or run a single route
#[derive(Debug, Error)]
pub enum RouteError {
    /// Another live route already owns the alias
    #[error("alias {alias:?} is already served by provider {existing}, rejected from {incoming}")]
    AliasCollision {
        alias: String,
        existing: String,
        incoming: String,
    },
    #[error("invalid route: {0}")]
    Invalid(String),
    #[error("listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept: {0}")]
    Accept(#[source] io::Error),
    #[error("unknown agent {0:?}")]
    UnknownAgent(String),
    /// The owning task was already shutting down
    #[error("route cancelled before it started")]
    Cancelled,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Failure of a container lifecycle capability (docker or agent)
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("docker: {0}")]
    Docker(String),
    #[error("agent {agent}: {message}")]
    Agent { agent: String, message: String },
    #[error("container {0} not found")]
    NotFound(String),
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("event stream: {0}")]
    Events(String),
}

/// A health probe could not produce a result
#[derive(Debug, Clone, Error)]
pub enum HealthError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("connect {target}: {message}")]
    Connect { target: String, message: String },
    #[error("agent {agent}: {message}")]
    Agent { agent: String, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Outcome of a failed wake, shared by every caller waiting on it
#[derive(Debug, Clone, Error)]
pub enum WakeError {
    #[error("backend did not become ready within {0:?}")]
    Timeout(Duration),
    #[error("wake failed: {0}")]
    Capability(#[from] CapabilityError),
    #[error("wake cancelled")]
    Cancelled,
}

/// Failure to load or watch a route source
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("docker: {0}")]
    Docker(String),
    #[error("watch: {0}")]
    Watch(String),
}

/// Problems reported by an event queue without stopping it
#[derive(Debug, Clone, Error)]
pub enum EventQueueError {
    #[error("event source: {0}")]
    Producer(String),
    #[error("flush handler panicked: {0}")]
    HandlerPanic(String),
}

/// Aggregate of per-subject errors (usually keyed by route alias).
///
/// One bad subject never hides the others: every error is kept and reported
/// together.
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    subject: String,
    errors: Vec<(String, String)>,
}

impl ErrorList {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            errors: Vec::new(),
        }
    }

    pub fn add(&mut self, subject: impl Into<String>, err: impl fmt::Display) {
        self.errors.push((subject.into(), err.to_string()));
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Subjects that have at least one error
    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|(s, _)| s.as_str())
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.errors.iter().any(|(s, _)| s == subject)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.errors.iter().map(|(s, e)| (s.as_str(), e.as_str()))
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.subject)?;
        for (subject, err) in &self.errors {
            write!(f, "\n  - {}: {}", subject, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

/// Error codes for entrypoint errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No live route for the host
    UnknownHost,
    /// Request may not wake a napping route
    WakeRefused,
    /// Backend failed to wake
    WakeFailed,
    /// Backend did not become ready within the wake timeout
    WakeTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Backend did not answer within the request timeout
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::WakeRefused => StatusCode::FORBIDDEN,
            ProxyErrorCode::WakeFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::WakeTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::WakeRefused => "WAKE_REFUSED",
            ProxyErrorCode::WakeFailed => "WAKE_FAILED",
            ProxyErrorCode::WakeTimeout => "WAKE_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&WakeError> for ProxyErrorCode {
    fn from(err: &WakeError) -> Self {
        match err {
            WakeError::Timeout(_) => ProxyErrorCode::WakeTimeout,
            WakeError::Capability(_) | WakeError::Cancelled => ProxyErrorCode::WakeFailed,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-proxy-error", HeaderValue::from_static(code.as_header_value()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_errors_map_to_status() {
        let timeout = WakeError::Timeout(Duration::from_secs(30));
        assert_eq!(
            ProxyErrorCode::from(&timeout).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );

        let failed = WakeError::Capability(CapabilityError::NotFound("app".into()));
        assert_eq!(
            ProxyErrorCode::from(&failed).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyErrorCode::WakeRefused.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::WakeTimeout, "app did not wake");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "WAKE_TIMEOUT"
        );
    }

    #[test]
    fn test_error_response_json() {
        let json = ErrorResponse::new(ProxyErrorCode::UnknownHost, "no route for example.com").to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"no route for example.com\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_error_list_keeps_every_subject() {
        let mut errs = ErrorList::new("file provider routes.toml");
        errs.add("app", "port is required");
        errs.add("db", RouteError::Invalid("unknown scheme".into()));

        assert_eq!(errs.len(), 2);
        assert!(errs.contains("app"));
        assert!(!errs.contains("web"));
        assert_eq!(
            errs.to_string(),
            "file provider routes.toml:\n  - app: port is required\n  - db: invalid route: unknown scheme"
        );
    }

    #[test]
    fn test_collision_message_names_both_providers() {
        let err = RouteError::AliasCollision {
            alias: "app".into(),
            existing: "file:routes".into(),
            incoming: "docker:local".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("file:routes"));
        assert!(msg.contains("docker:local"));
    }
}
