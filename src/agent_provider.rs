//! Routes from the Docker engine behind a remote agent
//!
//! Containers are listed through the agent and shaped by the same `proxy.*`
//! labels as on a local engine. Every route found this way is controlled and
//! health-checked through the agent. Agents do not stream engine events, so
//! the container list is polled and a change triggers a reload.

use crate::agent::{transition_event, AgentClient};
use crate::config::DockerProviderConfig;
use crate::control::ContainerStatus;
use crate::docker_provider::{affects_routes, container_name, container_routes};
use crate::error::ProviderError;
use crate::events::{Event, EventAction, EventKind};
use crate::provider::{ProviderImpl, ProviderWatch, RouteCandidate};
use async_trait::async_trait;
use bollard::models::ContainerSummary;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct AgentProvider {
    name: String,
    agent: Arc<AgentClient>,
    engine: DockerProviderConfig,
    poll_interval: Duration,
}

impl AgentProvider {
    pub fn new(agent: Arc<AgentClient>) -> Self {
        Self {
            name: format!("agent:{}", agent.name()),
            engine: DockerProviderConfig {
                host: agent.base_url().to_string(),
                explicit_only: false,
            },
            agent,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl ProviderImpl for AgentProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        self.agent.name()
    }

    fn kind(&self) -> EventKind {
        EventKind::Docker
    }

    async fn check(&self) -> Result<(), ProviderError> {
        self.agent
            .ping()
            .await
            .map_err(|e| ProviderError::Docker(e.to_string()))
    }

    async fn load_routes(&self) -> Result<Vec<RouteCandidate>, ProviderError> {
        let containers = self
            .agent
            .list_containers()
            .await
            .map_err(|e| ProviderError::Docker(e.to_string()))?;

        let agent = self.agent.name();
        Ok(containers
            .iter()
            .flat_map(|c| container_routes(c, &self.engine))
            .map(|(alias, route)| {
                let route = route.map(|mut config| {
                    config.agent = Some(agent.to_string());
                    config
                });
                (alias, route)
            })
            .collect())
    }

    fn watch(&self, cancel: CancellationToken) -> ProviderWatch {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(&self.agent);
        let interval = self.poll_interval;

        tokio::spawn(async move {
            let mut last: Option<HashMap<String, Seen>> = None;
            loop {
                match agent.list_containers().await {
                    Ok(containers) => {
                        let current = seen(&containers);
                        if let Some(prev) = &last {
                            for event in changes(prev, &current) {
                                debug!(agent = %agent.name(), container = %event.actor_name, action = %event.action, "Container changed");
                                if event_tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        last = Some(current);
                    }
                    Err(e) => {
                        if err_tx.send(ProviderError::Docker(e.to_string())).is_err() {
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

#[derive(Debug, Clone, PartialEq)]
struct Seen {
    name: String,
    status: ContainerStatus,
}

/// Containers by id
fn seen(containers: &[ContainerSummary]) -> HashMap<String, Seen> {
    containers
        .iter()
        .filter_map(|c| {
            let id = c.id.clone()?;
            let status = c
                .state
                .as_deref()
                .map(ContainerStatus::from_state)
                .unwrap_or(ContainerStatus::Unknown);
            let name = container_name(c).unwrap_or_else(|| id.clone());
            Some((id, Seen { name, status }))
        })
        .collect()
}

/// Route-affecting events between two polls, ordered by container id
fn changes(prev: &HashMap<String, Seen>, current: &HashMap<String, Seen>) -> Vec<Event> {
    let mut events = Vec::new();
    for (id, now) in current {
        let action = match prev.get(id) {
            None => Some(EventAction::Create),
            Some(before) if before.name != now.name => Some(EventAction::Create),
            Some(before) => transition_event(before.status, now.status),
        };
        if let Some(action) = action.filter(|a| affects_routes(*a)) {
            events.push(Event::docker(action, now.name.clone(), id.clone()));
        }
    }
    for (id, before) in prev {
        if !current.contains_key(id) {
            events.push(Event::docker(EventAction::Destroy, before.name.clone(), id.clone()));
        }
    }
    events.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::route::Scheme;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Agent serving a container list the test can swap out
    async fn fake_agent(containers: Arc<Mutex<String>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let containers = Arc::clone(&containers);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let containers = Arc::clone(&containers);
                        async move {
                            let (status, body) = match req.uri().path() {
                                "/docker/_ping" => (200, "OK".to_string()),
                                "/docker/containers/json" => (200, containers.lock().clone()),
                                _ => (404, "not found".to_string()),
                            };
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "application/json")
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn client(url: String) -> Arc<AgentClient> {
        Arc::new(AgentClient::new("edge", &AgentConfig { url, token: None }).unwrap())
    }

    fn container_json(name: &str, state: &str) -> String {
        format!(
            r#"{{"Id":"{name}-id","Names":["/{name}"],"State":"{state}","Labels":{{"proxy.port":"8080"}},"Ports":[{{"PrivatePort":8080,"PublicPort":32768,"Type":"tcp"}}]}}"#
        )
    }

    fn list(containers: &[(&str, &str)]) -> String {
        let items: Vec<String> = containers.iter().map(|(n, s)| container_json(n, s)).collect();
        format!("[{}]", items.join(","))
    }

    #[tokio::test]
    async fn test_routes_are_bound_to_the_agent() {
        let containers = Arc::new(Mutex::new(list(&[("web", "running"), ("old", "exited")])));
        let addr = fake_agent(containers).await;
        let provider = AgentProvider::new(client(format!("http://{}", addr)));
        assert_eq!(provider.name(), "agent:edge");
        provider.check().await.unwrap();

        let routes = provider.load_routes().await.unwrap();
        assert_eq!(routes.len(), 1);
        let (alias, route) = &routes[0];
        assert_eq!(alias, "web");
        let route = route.as_ref().unwrap();
        assert_eq!(route.scheme, Scheme::Http);
        assert_eq!(route.host, "127.0.0.1");
        assert_eq!(route.port, 32768);
        assert_eq!(route.agent.as_deref(), Some("edge"));
        assert_eq!(route.container.as_ref().unwrap().id, "web-id");
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = AgentProvider::new(client(format!("http://{}", addr)));
        assert!(matches!(provider.check().await, Err(ProviderError::Docker(_))));
        assert!(provider.load_routes().await.is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_container_changes() {
        let containers = Arc::new(Mutex::new(list(&[("web", "running")])));
        let addr = fake_agent(Arc::clone(&containers)).await;
        let provider =
            AgentProvider::new(client(format!("http://{}", addr))).with_poll_interval(Duration::from_millis(30));

        let cancel = CancellationToken::new();
        let (mut events, _errors) = provider.watch(cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        *containers.lock() = list(&[("web", "running"), ("api", "running")]);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Docker);
        assert_eq!(event.action, EventAction::Create);
        assert_eq!(event.actor_name, "api");
        cancel.cancel();
    }

    fn entry(name: &str, status: ContainerStatus) -> (String, Seen) {
        (
            format!("{}-id", name),
            Seen {
                name: name.to_string(),
                status,
            },
        )
    }

    #[test]
    fn test_changes_between_polls() {
        use ContainerStatus::*;
        let prev: HashMap<_, _> = [entry("a", Running), entry("b", Running), entry("c", Running)].into();
        let current: HashMap<_, _> = [entry("a", Running), entry("b", Stopped), entry("c", Paused), entry("d", Running)].into();

        let events = changes(&prev, &current);
        let actions: Vec<_> = events.iter().map(|e| (e.actor_name.as_str(), e.action)).collect();
        // Pausing keeps the route, so `c` is not reported
        assert_eq!(actions, vec![("b", EventAction::Die), ("d", EventAction::Create)]);

        let events = changes(&current, &HashMap::new());
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.action == EventAction::Destroy));
    }
}
