//! Remote agent client
//!
//! An agent runs next to a remote Docker engine and exposes two things over
//! HTTP: health probes executed from its own network (`/v1/health`) and a
//! proxied subset of the engine API (`/docker/containers/{id}/...`).

use crate::config::AgentConfig;
use crate::control::{ContainerControl, ContainerStatus, EventStreams};
use crate::error::{CapabilityError, HealthError};
use crate::events::{Event, EventAction};
use crate::health::HealthCheckResult;
use crate::route::Scheme;
use async_trait::async_trait;
use bollard::models::ContainerSummary;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const AGENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct AgentClient {
    name: String,
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(name: impl Into<String>, config: &AgentConfig) -> Result<Self, CapabilityError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(AGENT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| CapabilityError::Agent {
                agent: name.clone(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            name,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    /// Build one client per configured agent
    pub fn from_config(
        agents: &HashMap<String, AgentConfig>,
    ) -> Result<HashMap<String, Arc<AgentClient>>, CapabilityError> {
        agents
            .iter()
            .map(|(name, config)| Ok((name.clone(), Arc::new(AgentClient::new(name, config)?))))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn agent_error(&self, message: impl Into<String>) -> CapabilityError {
        CapabilityError::Agent {
            agent: self.name.clone(),
            message: message.into(),
        }
    }

    /// Run a health probe from the agent's network
    pub async fn check_health(
        &self,
        scheme: Scheme,
        target: &str,
        path: &str,
    ) -> Result<HealthCheckResult, HealthError> {
        let query = format!(
            "/v1/health?scheme={}&host={}&path={}",
            scheme,
            urlencoding::encode(target),
            urlencoding::encode(path)
        );
        let resp = self
            .request(reqwest::Method::GET, &query)
            .send()
            .await
            .map_err(|e| HealthError::Agent {
                agent: self.name.clone(),
                message: e.to_string(),
            })?;

        if resp.status() == StatusCode::OK {
            return resp
                .json::<HealthCheckResult>()
                .await
                .map_err(|e| HealthError::InvalidResponse(e.to_string()));
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(HealthError::Agent {
            agent: self.name.clone(),
            message: if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            },
        })
    }

    /// Check that the agent and the engine behind it answer
    pub async fn ping(&self) -> Result<(), CapabilityError> {
        let resp = self
            .request(reqwest::Method::GET, "/docker/_ping")
            .send()
            .await
            .map_err(|e| self.agent_error(format!("ping: {}", e)))?;
        if !resp.status().is_success() {
            return Err(self.agent_error(format!("ping: {}", resp.status())));
        }
        Ok(())
    }

    /// All containers on the agent's engine, running or not
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, CapabilityError> {
        let resp = self
            .request(reqwest::Method::GET, "/docker/containers/json")
            .query(&[("all", "1")])
            .send()
            .await
            .map_err(|e| self.agent_error(format!("list containers: {}", e)))?;
        if !resp.status().is_success() {
            return Err(self.agent_error(format!("list containers: {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| self.agent_error(format!("list containers: {}", e)))
    }

    async fn container_op(&self, id: &str, op: &str, query: &[(&str, String)]) -> Result<(), CapabilityError> {
        let path = format!("/docker/containers/{}/{}", urlencoding::encode(id), op);
        let resp = self
            .request(reqwest::Method::POST, &path)
            .query(query)
            .send()
            .await
            .map_err(|e| self.agent_error(format!("{} {}: {}", op, id, e)))?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // Already in the requested state
            StatusCode::NOT_MODIFIED | StatusCode::CONFLICT => Ok(()),
            StatusCode::NOT_FOUND => Err(CapabilityError::NotFound(id.to_string())),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(self.agent_error(format!("{} {}: {} {}", op, id, s, body.trim())))
            }
        }
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, CapabilityError> {
        let path = format!("/docker/containers/{}/json", urlencoding::encode(id));
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| self.agent_error(format!("inspect {}: {}", id, e)))?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(CapabilityError::NotFound(id.to_string())),
            s => return Err(self.agent_error(format!("inspect {}: {}", id, s))),
        }

        let inspect: InspectResponse = resp
            .json()
            .await
            .map_err(|e| self.agent_error(format!("inspect {}: {}", id, e)))?;
        Ok(inspect.status())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    #[serde(default)]
    state: Option<InspectState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    paused: bool,
}

impl InspectResponse {
    fn status(&self) -> ContainerStatus {
        match &self.state {
            Some(state) if state.paused => ContainerStatus::Paused,
            Some(state) => ContainerStatus::from_state(&state.status),
            None => ContainerStatus::Unknown,
        }
    }
}

/// A container on an agent's Docker engine
pub struct AgentContainer {
    agent: Arc<AgentClient>,
    id: String,
    poll_interval: Duration,
}

impl AgentContainer {
    pub fn new(agent: Arc<AgentClient>, id: impl Into<String>) -> Self {
        Self {
            agent,
            id: id.into(),
            poll_interval: STATUS_POLL_INTERVAL,
        }
    }
}

/// Synthesize the lifecycle event implied by a status change
pub(crate) fn transition_event(from: ContainerStatus, to: ContainerStatus) -> Option<EventAction> {
    use ContainerStatus::*;
    match (from, to) {
        (a, b) if a == b => None,
        (_, Paused) => Some(EventAction::Pause),
        (_, Stopped) => Some(EventAction::Die),
        (Paused, Running) => Some(EventAction::Unpause),
        (_, Running) => Some(EventAction::Start),
        (_, Unknown) => None,
    }
}

#[async_trait]
impl ContainerControl for AgentContainer {
    fn container_id(&self) -> &str {
        &self.id
    }

    async fn pause(&self) -> Result<(), CapabilityError> {
        self.agent.container_op(&self.id, "pause", &[]).await
    }

    async fn unpause(&self) -> Result<(), CapabilityError> {
        self.agent.container_op(&self.id, "unpause", &[]).await
    }

    async fn start(&self) -> Result<(), CapabilityError> {
        self.agent.container_op(&self.id, "start", &[]).await
    }

    async fn stop(&self, signal: Option<&str>, timeout: Duration) -> Result<(), CapabilityError> {
        let mut query = vec![("t", timeout.as_secs().to_string())];
        if let Some(signal) = signal {
            query.push(("signal", signal.to_string()));
        }
        self.agent.container_op(&self.id, "stop", &query).await
    }

    async fn kill(&self, signal: Option<&str>) -> Result<(), CapabilityError> {
        let query = [("signal", signal.unwrap_or("SIGKILL").to_string())];
        self.agent.container_op(&self.id, "kill", &query).await
    }

    async fn status(&self) -> Result<ContainerStatus, CapabilityError> {
        self.agent.container_status(&self.id).await
    }

    /// Agents do not stream engine events; state changes are polled.
    fn watch(&self, cancel: CancellationToken) -> EventStreams {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(&self.agent);
        let id = self.id.clone();
        let interval = self.poll_interval;

        tokio::spawn(async move {
            let mut last: Option<ContainerStatus> = None;
            loop {
                match agent.container_status(&id).await {
                    Ok(status) => {
                        if let Some(action) = last.and_then(|prev| transition_event(prev, status)) {
                            debug!(agent = %agent.name, container_id = %id, action = %action, "Container state changed");
                            if event_tx.send(Event::docker(action, id.clone(), id.clone())).is_err() {
                                return;
                            }
                        }
                        last = Some(status);
                    }
                    Err(e) => {
                        if err_tx.send(e).is_err() {
                            return;
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        (event_rx, err_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckResult;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Minimal agent answering every request with the given status and body,
    /// echoing the request line into the `x-seen` header
    async fn fake_agent(status: u16, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                        let auth = req
                            .headers()
                            .get("authorization")
                            .map(|v| v.to_str().unwrap_or("").to_string())
                            .unwrap_or_default();
                        let seen = format!("{} {} {}", req.method(), req.uri(), auth);
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .header("content-type", "application/json")
                                .header("x-seen", seen)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn client(addr: SocketAddr) -> AgentClient {
        AgentClient::new(
            "edge",
            &AgentConfig {
                url: format!("http://{}/", addr),
                token: Some("secret".into()),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_ok_decodes_result() {
        let addr = fake_agent(200, r#"{"healthy":true,"latency":1000000}"#).await;
        let result = client(addr)
            .check_health(Scheme::Http, "10.0.0.2:8080", "/health")
            .await
            .unwrap();
        assert_eq!(result, HealthCheckResult::healthy(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_health_non_200_body_is_error() {
        let addr = fake_agent(500, "dial tcp 10.0.0.2:8080: connection refused").await;
        let err = client(addr)
            .check_health(Scheme::Tcp, "10.0.0.2:8080", "")
            .await
            .unwrap_err();
        match err {
            HealthError::Agent { agent, message } => {
                assert_eq!(agent, "edge");
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_container_status_parsing() {
        let addr = fake_agent(200, r#"{"Id":"abc","State":{"Status":"paused","Paused":true}}"#).await;
        let container = AgentContainer::new(Arc::new(client(addr)), "abc");
        assert_eq!(container.status().await.unwrap(), ContainerStatus::Paused);
    }

    #[tokio::test]
    async fn test_container_ops_map_status_codes() {
        let addr = fake_agent(404, "no such container").await;
        let container = AgentContainer::new(Arc::new(client(addr)), "gone");
        assert!(matches!(container.start().await, Err(CapabilityError::NotFound(_))));

        let addr = fake_agent(304, "").await;
        let container = AgentContainer::new(Arc::new(client(addr)), "abc");
        container.unpause().await.unwrap();
    }

    #[test]
    fn test_transition_events() {
        use ContainerStatus::*;
        assert_eq!(transition_event(Running, Paused), Some(EventAction::Pause));
        assert_eq!(transition_event(Running, Stopped), Some(EventAction::Die));
        assert_eq!(transition_event(Paused, Running), Some(EventAction::Unpause));
        assert_eq!(transition_event(Stopped, Running), Some(EventAction::Start));
        assert_eq!(transition_event(Running, Running), None);
    }
}
