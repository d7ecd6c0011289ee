//! Health probes: HTTP, raw TCP/UDP dial, and probes run by a remote agent

use crate::agent::AgentClient;
use crate::error::{HealthError, RouteError};
use crate::health::{HealthCheckConfig, HealthCheckResult, HealthChecker};
use crate::route::{RouteConfig, Scheme};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpStream, UdpSocket};

/// Build the checker matching a route's scheme and reachability
pub fn new_checker(
    route: &RouteConfig,
    agents: &HashMap<String, Arc<AgentClient>>,
) -> Result<Arc<dyn HealthChecker>, RouteError> {
    let config = route.healthcheck.clone();
    let target = route.target();

    if let Some(name) = &route.agent {
        let agent = agents
            .get(name)
            .ok_or_else(|| RouteError::UnknownAgent(name.clone()))?;
        return Ok(Arc::new(AgentProbe {
            agent: Arc::clone(agent),
            scheme: route.scheme,
            target,
            config,
        }));
    }

    Ok(match route.scheme {
        Scheme::Http => Arc::new(HttpProbe::new(target, config)?),
        Scheme::Tcp | Scheme::Udp => Arc::new(RawProbe {
            scheme: route.scheme,
            target,
            config,
        }),
    })
}

/// `HEAD` (or `GET`) request against the route's health path.
///
/// Any response below 500 counts as healthy; redirects are not followed.
pub struct HttpProbe {
    url: String,
    config: HealthCheckConfig,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(target: String, config: HealthCheckConfig) -> Result<Self, RouteError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| RouteError::Invalid(format!("health check client: {}", e)))?;

        Ok(Self {
            url: format!("http://{}{}", target, config.path()),
            config,
            client,
        })
    }
}

#[async_trait]
impl HealthChecker for HttpProbe {
    async fn check_health(&self) -> Result<HealthCheckResult, HealthError> {
        let method = if self.config.use_get {
            reqwest::Method::GET
        } else {
            reqwest::Method::HEAD
        };

        let start = Instant::now();
        let resp = self
            .client
            .request(method, &self.url)
            .send()
            .await
            .map_err(|e| HealthError::Request(e.to_string()))?;
        let latency = start.elapsed();

        let status = resp.status();
        if status.is_server_error() {
            return Ok(HealthCheckResult::unhealthy(status.to_string(), latency));
        }
        Ok(HealthCheckResult::healthy(latency))
    }

    fn target(&self) -> String {
        self.url.clone()
    }

    fn config(&self) -> &HealthCheckConfig {
        &self.config
    }
}

/// Dial probe for stream routes.
///
/// TCP: a completed handshake is healthy, a refused connection unhealthy.
/// UDP has no handshake, so only local socket errors are reported.
pub struct RawProbe {
    scheme: Scheme,
    target: String,
    config: HealthCheckConfig,
}

impl RawProbe {
    async fn dial_udp(&self) -> io::Result<()> {
        let bind = if self.target.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(&self.target).await
    }
}

#[async_trait]
impl HealthChecker for RawProbe {
    async fn check_health(&self) -> Result<HealthCheckResult, HealthError> {
        let start = Instant::now();
        let result = match self.scheme {
            Scheme::Udp => self.dial_udp().await,
            _ => TcpStream::connect(&self.target).await.map(drop),
        };
        let latency = start.elapsed();

        match result {
            Ok(()) => Ok(HealthCheckResult::healthy(latency)),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) =>
            {
                Ok(HealthCheckResult::unhealthy(e.to_string(), latency))
            }
            Err(e) => Err(HealthError::Connect {
                target: self.target.clone(),
                message: e.to_string(),
            }),
        }
    }

    fn target(&self) -> String {
        format!("{}://{}", self.scheme, self.target)
    }

    fn config(&self) -> &HealthCheckConfig {
        &self.config
    }
}

/// Probe executed by a remote agent from its own network
pub struct AgentProbe {
    agent: Arc<AgentClient>,
    scheme: Scheme,
    target: String,
    config: HealthCheckConfig,
}

#[async_trait]
impl HealthChecker for AgentProbe {
    async fn check_health(&self) -> Result<HealthCheckResult, HealthError> {
        self.agent
            .check_health(self.scheme, &self.target, self.config.path())
            .await
    }

    fn target(&self) -> String {
        format!("{}://{} via {}", self.scheme, self.target, self.agent.name())
    }

    fn config(&self) -> &HealthCheckConfig {
        &self.config
    }
}
