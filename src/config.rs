use crate::idlewatcher::{DEFAULT_STOP_TIMEOUT, DEFAULT_WAKE_TIMEOUT};
use crate::route::RouteConfig;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Defaults applied to every route that does not set its own value
    #[serde(default)]
    pub defaults: RouteDefaults,

    /// Route sources
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Remote agents, keyed by name
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP entrypoint port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API, bound to localhost (set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the /v1 admin endpoints.
    /// If not set, a random token is generated at startup and printed to stderr
    pub admin_token: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend response (default: 30s)
    #[serde(default = "default_request_timeout", with = "duration")]
    pub request_timeout: Duration,

    /// Max time to wait for routes to finish on shutdown (default: 10s)
    #[serde(default = "default_shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouteDefaults {
    #[serde(default = "default_health_interval", with = "duration")]
    pub health_check_interval: Duration,

    #[serde(default = "default_health_timeout", with = "duration")]
    pub health_check_timeout: Duration,

    #[serde(default = "default_wake_timeout", with = "duration")]
    pub wake_timeout: Duration,

    #[serde(default = "default_stop_timeout", with = "duration")]
    pub stop_timeout: Duration,

    /// Debounce window for discovery events
    #[serde(default = "default_event_flush_interval", with = "duration")]
    pub event_flush_interval: Duration,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_interval(),
            health_check_timeout: default_health_timeout(),
            wake_timeout: default_wake_timeout(),
            stop_timeout: default_stop_timeout(),
            event_flush_interval: default_event_flush_interval(),
        }
    }
}

impl RouteDefaults {
    /// Fill every unset duration of `route` from these defaults
    pub fn apply(&self, route: &mut RouteConfig) {
        let hc = &mut route.healthcheck;
        hc.interval.get_or_insert(self.health_check_interval);
        hc.timeout.get_or_insert(self.health_check_timeout);

        if let Some(idle) = route.idle_watcher.as_mut() {
            idle.wake_timeout.get_or_insert(self.wake_timeout);
            idle.stop_timeout.get_or_insert(self.stop_timeout);
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    /// Route files, each one a file provider
    #[serde(default)]
    pub files: Vec<String>,

    /// Docker engines, keyed by provider name
    #[serde(default)]
    pub docker: HashMap<String, DockerProviderConfig>,

    /// Agents whose Docker engine is a route source (names from `[agents]`)
    #[serde(default)]
    pub agents: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DockerProviderConfig {
    /// Docker host URL (default: local socket)
    #[serde(default = "default_docker_host")]
    pub host: String,

    /// Only route containers that carry `proxy.*` labels
    #[serde(default)]
    pub explicit_only: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AgentConfig {
    /// Base URL of the agent API
    pub url: String,

    /// Bearer token sent with every request
    pub token: Option<String>,
}

/// Human-readable durations (`"5s"`, `"300ms"`, `"1h 30m"`) for serde
pub mod duration {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }

    pub mod option {
        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|s| humantime::parse_duration(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8888
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_interval() -> Duration {
    crate::health::DEFAULT_INTERVAL
}

fn default_health_timeout() -> Duration {
    crate::health::DEFAULT_TIMEOUT
}

fn default_wake_timeout() -> Duration {
    DEFAULT_WAKE_TIMEOUT
}

fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}

fn default_event_flush_interval() -> Duration {
    crate::events::DEFAULT_FLUSH_INTERVAL
}

fn default_docker_host() -> String {
    crate::docker::DEFAULT_DOCKER_HOST.to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.defaults.event_flush_interval.is_zero() {
            errors.push("defaults.event_flush_interval must be greater than 0".to_string());
        }
        if self.defaults.wake_timeout.is_zero() {
            errors.push("defaults.wake_timeout must be greater than 0".to_string());
        }
        if self.defaults.health_check_interval.is_zero() {
            errors.push("defaults.health_check_interval must be greater than 0".to_string());
        }

        for file in &self.providers.files {
            if file.trim().is_empty() {
                errors.push("providers.files contains an empty path".to_string());
            }
        }

        for (name, docker) in &self.providers.docker {
            if docker.host.trim().is_empty() {
                errors.push(format!("Docker provider '{}': 'host' must not be empty", name));
            }
        }

        for name in &self.providers.agents {
            if !self.agents.contains_key(name) {
                errors.push(format!("providers.agents: unknown agent '{}'", name));
            }
        }

        for (name, agent) in &self.agents {
            if !agent.url.starts_with("http://") && !agent.url.starts_with("https://") {
                errors.push(format!(
                    "Agent '{}': 'url' must start with http:// or https://",
                    name
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
