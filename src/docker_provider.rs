//! Routes from Docker containers
//!
//! Every container becomes one route per alias (its name by default). The
//! route is shaped by `proxy.*` labels; a label scoped to one alias
//! (`proxy.<alias>.port`) wins over the shared one (`proxy.port`).

use crate::config::DockerProviderConfig;
use crate::docker::DockerClient;
use crate::error::{CapabilityError, ProviderError};
use crate::events::{EventAction, EventKind};
use crate::health::HealthCheckConfig;
use crate::idlewatcher::IdleWatcherConfig;
use crate::provider::{ProviderImpl, ProviderWatch, RouteCandidate};
use crate::route::{ContainerRef, RouteConfig, Scheme};
use async_trait::async_trait;
use bollard::models::ContainerSummary;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const NS: &str = "proxy.";

pub const LABEL_ALIASES: &str = "proxy.aliases";
pub const LABEL_EXCLUDE: &str = "proxy.exclude";

/// Well-known ports of datastores that should never be exposed by accident
const DATABASE_PORTS: [u16; 5] = [5432, 3306, 6379, 11211, 27017];
const DATABASE_MOUNTS: [&str; 6] = [
    "/var/lib/postgresql/data",
    "/var/lib/mysql",
    "/var/lib/mongodb",
    "/var/lib/mariadb",
    "/var/lib/memcached",
    "/var/lib/rabbitmq",
];

pub struct DockerProvider {
    name: String,
    short_name: String,
    config: DockerProviderConfig,
    client: Arc<DockerClient>,
}

impl DockerProvider {
    pub fn new(short_name: impl Into<String>, config: DockerProviderConfig) -> Result<Self, CapabilityError> {
        let short_name = short_name.into();
        let client = Arc::new(DockerClient::connect(Some(&config.host))?);
        Ok(Self {
            name: format!("docker:{}", short_name),
            short_name,
            config,
            client,
        })
    }
}

#[async_trait]
impl ProviderImpl for DockerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        &self.short_name
    }

    fn kind(&self) -> EventKind {
        EventKind::Docker
    }

    async fn check(&self) -> Result<(), ProviderError> {
        self.client
            .ping()
            .await
            .map_err(|e| ProviderError::Docker(e.to_string()))
    }

    async fn load_routes(&self) -> Result<Vec<RouteCandidate>, ProviderError> {
        let containers = self
            .client
            .list_containers()
            .await
            .map_err(|e| ProviderError::Docker(format!("{}: {}", self.client.host(), e)))?;
        Ok(containers
            .iter()
            .flat_map(|c| container_routes(c, &self.config))
            .collect())
    }

    fn watch(&self, cancel: CancellationToken) -> ProviderWatch {
        let (mut events, mut errors) = self.client.events(None, cancel.clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut errors_open = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if affects_routes(event.action) && event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    err = errors.recv(), if errors_open => match err {
                        Some(e) => {
                            let _ = err_tx.send(ProviderError::Docker(e.to_string()));
                        }
                        None => errors_open = false,
                    },
                }
            }
        });

        (event_rx, err_rx)
    }
}

pub(crate) fn affects_routes(action: EventAction) -> bool {
    !matches!(action, EventAction::Pause | EventAction::Unpause | EventAction::Other)
}

/// Labels of one container as seen by one of its aliases
struct Labels<'a> {
    all: &'a HashMap<String, String>,
    alias: &'a str,
}

impl Labels<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.all
            .get(&format!("{}{}.{}", NS, self.alias, key))
            .or_else(|| self.all.get(&format!("{}{}", NS, key)))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, String>
    where
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|v| v.parse::<T>().map_err(|e| format!("label {}{}: {}", NS, key, e)))
            .transpose()
    }

    fn bool(&self, key: &str) -> Result<bool, String> {
        match self.get(key) {
            None => Ok(false),
            Some(v) => parse_bool(v).ok_or_else(|| format!("label {}{}: invalid boolean {:?}", NS, key, v)),
        }
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>, String> {
        self.get(key)
            .map(|v| humantime::parse_duration(v).map_err(|e| format!("label {}{}: {}", NS, key, e)))
            .transpose()
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn container_name(c: &ContainerSummary) -> Option<String> {
    c.names
        .as_ref()?
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
}

fn is_explicit(labels: &HashMap<String, String>) -> bool {
    labels.keys().any(|k| k.starts_with(NS))
}

fn is_database(c: &ContainerSummary) -> bool {
    let db_port = c
        .ports
        .iter()
        .flatten()
        .any(|p| DATABASE_PORTS.contains(&p.private_port));
    let db_mount = c
        .mounts
        .iter()
        .flatten()
        .filter_map(|m| m.destination.as_deref())
        .any(|d| DATABASE_MOUNTS.contains(&d));
    db_port || db_mount
}

fn is_local(host: &str) -> bool {
    host.starts_with("unix://")
}

/// Hostname of a remote engine endpoint such as `tcp://10.0.0.5:2375`
fn engine_hostname(host: &str) -> String {
    let url = host.replacen("tcp://", "http://", 1);
    reqwest::Url::parse(&url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Where the proxy reaches a container's private port.
///
/// Local engines: the container's own address and the private port. Remote
/// engines: the engine's hostname and the published port.
fn resolve_target(c: &ContainerSummary, host: &str, private_port: Option<u16>) -> Result<(String, u16), String> {
    let ports: Vec<_> = c.ports.iter().flatten().collect();
    let private_port = match private_port {
        Some(p) => p,
        None => {
            let mut private: Vec<u16> = ports.iter().map(|p| p.private_port).collect();
            private.sort_unstable();
            *private
                .first()
                .ok_or_else(|| "container exposes no port, set the proxy.port label".to_string())?
        }
    };

    if is_local(host) {
        let ip = c
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
            .and_then(|nets| {
                nets.values()
                    .filter_map(|n| n.ip_address.as_deref())
                    .find(|ip| !ip.is_empty())
                    .map(str::to_string)
            });
        if let Some(ip) = ip {
            return Ok((ip, private_port));
        }
    }

    let public = ports
        .iter()
        .find(|p| p.private_port == private_port && p.public_port.is_some())
        .and_then(|p| p.public_port);
    let hostname = if is_local(host) {
        "127.0.0.1".to_string()
    } else {
        engine_hostname(host)
    };
    match public {
        Some(port) => Ok((hostname, port)),
        None if is_local(host) => Ok((hostname, private_port)),
        None => Err(format!("port {} is not published on {}", private_port, host)),
    }
}

fn idle_watcher_config(labels: &Labels<'_>) -> Result<Option<IdleWatcherConfig>, String> {
    let Some(idle_timeout) = labels.duration("idle_timeout")? else {
        return Ok(None);
    };
    let mut config = IdleWatcherConfig::new(idle_timeout);
    config.wake_timeout = labels.duration("wake_timeout")?;
    config.stop_timeout = labels.duration("stop_timeout")?;
    if let Some(method) = labels.parse("stop_method")? {
        config.stop_method = method;
    }
    config.stop_signal = labels.get("stop_signal").map(str::to_string);
    config.start_endpoint = labels.get("start_endpoint").map(str::to_string);
    Ok(Some(config))
}

fn healthcheck_config(labels: &Labels<'_>) -> Result<HealthCheckConfig, String> {
    Ok(HealthCheckConfig {
        disable: labels.bool("healthcheck.disable")?,
        path: labels.get("healthcheck.path").map(str::to_string),
        use_get: labels.bool("healthcheck.use_get")?,
        interval: labels.duration("healthcheck.interval")?,
        timeout: labels.duration("healthcheck.timeout")?,
    })
}

fn route_config(
    c: &ContainerSummary,
    id: &str,
    labels: &Labels<'_>,
    provider: &DockerProviderConfig,
) -> Result<RouteConfig, String> {
    let scheme = labels.parse::<Scheme>("scheme")?.unwrap_or_default();
    let (host, port) = match labels.get("host") {
        Some(host) => {
            let port = labels
                .parse::<u16>("port")?
                .ok_or_else(|| "label proxy.port is required with proxy.host".to_string())?;
            (host.to_string(), port)
        }
        None => resolve_target(c, &provider.host, labels.parse::<u16>("port")?)?,
    };

    let idle_watcher = idle_watcher_config(labels)?;
    Ok(RouteConfig {
        alias: labels.alias.to_string(),
        provider: String::new(),
        scheme,
        host,
        port,
        listen_port: labels.parse("listen_port")?,
        exclude: labels.bool("exclude")?,
        healthcheck: healthcheck_config(labels)?,
        idle_watcher,
        container: Some(ContainerRef {
            docker_host: Some(provider.host.clone()),
            id: id.to_string(),
        }),
        agent: labels.get("agent").map(str::to_string),
    })
}

/// Route candidates of one container; empty for containers that are not
/// meant to be proxied.
pub fn container_routes(c: &ContainerSummary, provider: &DockerProviderConfig) -> Vec<RouteCandidate> {
    let empty = HashMap::new();
    let labels = c.labels.as_ref().unwrap_or(&empty);
    let (Some(name), Some(id)) = (container_name(c), c.id.as_deref()) else {
        return Vec::new();
    };

    let explicit = is_explicit(labels);
    if provider.explicit_only && !explicit {
        return Vec::new();
    }
    if !explicit && is_database(c) {
        debug!(container = %name, "Skipping database container");
        return Vec::new();
    }
    if labels
        .get(LABEL_EXCLUDE)
        .and_then(|v| parse_bool(v))
        .unwrap_or(false)
    {
        return Vec::new();
    }

    let aliases: Vec<String> = match labels.get(LABEL_ALIASES) {
        Some(v) => v
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
        None => vec![name.clone()],
    };

    let running = c.state.as_deref() == Some("running");
    aliases
        .into_iter()
        .filter_map(|alias| {
            let view = Labels { all: labels, alias: &alias };
            // A stopped container can only be served by waking it
            if !running && view.get("idle_timeout").is_none() {
                debug!(container = %name, alias, state = ?c.state, "Skipping stopped container");
                return None;
            }
            let config = route_config(c, id, &view, provider);
            Some((alias, config))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idlewatcher::StopMethod;
    use bollard::models::{ContainerSummaryNetworkSettings, EndpointSettings, MountPoint, Port};

    fn local() -> DockerProviderConfig {
        DockerProviderConfig {
            host: "unix:///var/run/docker.sock".into(),
            explicit_only: false,
        }
    }

    fn container(name: &str, labels: &[(&str, &str)], ports: &[(u16, Option<u16>)]) -> ContainerSummary {
        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.5".into()),
                ..Default::default()
            },
        );
        ContainerSummary {
            id: Some(format!("{}-id", name)),
            names: Some(vec![format!("/{}", name)]),
            state: Some("running".into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|(private, public)| Port {
                        private_port: *private,
                        public_port: *public,
                        ..Default::default()
                    })
                    .collect(),
            ),
            network_settings: Some(ContainerSummaryNetworkSettings {
                networks: Some(networks),
            }),
            ..Default::default()
        }
    }

    fn single(c: &ContainerSummary, provider: &DockerProviderConfig) -> RouteConfig {
        let mut routes = container_routes(c, provider);
        assert_eq!(routes.len(), 1);
        routes.remove(0).1.unwrap()
    }

    #[test]
    fn test_local_container_uses_private_address() {
        let route = single(&container("web", &[], &[(8080, Some(32768)), (80, None)]), &local());
        assert_eq!(route.alias, "web");
        assert_eq!(route.host, "172.17.0.5");
        assert_eq!(route.port, 80);
        assert_eq!(route.container.unwrap().id, "web-id");
    }

    #[test]
    fn test_remote_container_uses_published_port() {
        let remote = DockerProviderConfig {
            host: "tcp://10.0.0.5:2375".into(),
            explicit_only: false,
        };
        let c = container("web", &[("proxy.port", "8080")], &[(8080, Some(32768))]);
        let route = single(&c, &remote);
        assert_eq!(route.host, "10.0.0.5");
        assert_eq!(route.port, 32768);

        let unpublished = container("api", &[], &[(9000, None)]);
        let routes = container_routes(&unpublished, &remote);
        assert!(routes[0].1.as_ref().unwrap_err().contains("not published"));
    }

    #[test]
    fn test_aliases_and_scoped_labels() {
        let c = container(
            "app",
            &[
                ("proxy.aliases", "app, admin"),
                ("proxy.port", "3000"),
                ("proxy.admin.port", "3001"),
                ("proxy.healthcheck.path", "/healthz"),
            ],
            &[(3000, None), (3001, None)],
        );
        let routes: HashMap<_, _> = container_routes(&c, &local())
            .into_iter()
            .map(|(a, r)| (a, r.unwrap()))
            .collect();
        assert_eq!(routes["app"].port, 3000);
        assert_eq!(routes["admin"].port, 3001);
        assert_eq!(routes["admin"].healthcheck.path.as_deref(), Some("/healthz"));
    }

    #[test]
    fn test_idle_watcher_labels() {
        let mut c = container(
            "lazy",
            &[
                ("proxy.idle_timeout", "15m"),
                ("proxy.stop_method", "stop"),
                ("proxy.stop_signal", "SIGTERM"),
                ("proxy.start_endpoint", "/wake"),
            ],
            &[(80, None)],
        );
        c.state = Some("exited".into());
        let route = single(&c, &local());
        let idle = route.idle_watcher.unwrap();
        assert_eq!(idle.idle_timeout, Duration::from_secs(900));
        assert_eq!(idle.stop_method, StopMethod::Stop);
        assert_eq!(idle.stop_signal.as_deref(), Some("SIGTERM"));
        assert_eq!(idle.start_endpoint.as_deref(), Some("/wake"));
    }

    #[test]
    fn test_stopped_container_without_idle_watcher_is_skipped() {
        let mut c = container("web", &[], &[(80, None)]);
        c.state = Some("exited".into());
        assert!(container_routes(&c, &local()).is_empty());
    }

    #[test]
    fn test_database_containers_skipped_unless_labelled() {
        let db = container("postgres", &[], &[(5432, None)]);
        assert!(container_routes(&db, &local()).is_empty());

        let mut mounted = container("store", &[], &[(9000, None)]);
        mounted.mounts = Some(vec![MountPoint {
            destination: Some("/var/lib/mysql".into()),
            ..Default::default()
        }]);
        assert!(container_routes(&mounted, &local()).is_empty());

        let labelled = container(
            "postgres",
            &[("proxy.scheme", "tcp"), ("proxy.listen_port", "15432")],
            &[(5432, None)],
        );
        let route = single(&labelled, &local());
        assert_eq!(route.scheme, Scheme::Tcp);
        assert_eq!(route.listen_port, Some(15432));
    }

    #[test]
    fn test_explicit_only_and_exclude() {
        let explicit_only = DockerProviderConfig {
            explicit_only: true,
            ..local()
        };
        assert!(container_routes(&container("web", &[], &[(80, None)]), &explicit_only).is_empty());
        assert_eq!(
            container_routes(&container("web", &[("proxy.port", "80")], &[(80, None)]), &explicit_only).len(),
            1
        );
        assert!(container_routes(&container("web", &[("proxy.exclude", "true")], &[(80, None)]), &local()).is_empty());
    }

    #[test]
    fn test_bad_labels_are_per_alias_errors() {
        let c = container("web", &[("proxy.scheme", "quic"), ("proxy.port", "80")], &[(80, None)]);
        let routes = container_routes(&c, &local());
        assert!(routes[0].1.as_ref().unwrap_err().contains("quic"));

        let c = container("web", &[("proxy.idle_timeout", "soon")], &[(80, None)]);
        assert!(container_routes(&c, &local())[0].1.is_err());

        let c = container("web", &[], &[]);
        assert!(container_routes(&c, &local())[0]
            .1
            .as_ref()
            .unwrap_err()
            .contains("proxy.port"));
    }

    #[test]
    fn test_event_filter() {
        assert!(affects_routes(EventAction::Start));
        assert!(affects_routes(EventAction::Destroy));
        assert!(!affects_routes(EventAction::Pause));
        assert!(!affects_routes(EventAction::Other));
    }
}
