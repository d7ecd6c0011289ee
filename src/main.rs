use routegate::admin::{AdminServer, PKG_NAME, VERSION};
use routegate::agent::AgentClient;
use routegate::agent_provider::AgentProvider;
use routegate::config::Config;
use routegate::control::DefaultResolver;
use routegate::docker_provider::DockerProvider;
use routegate::file_provider::FileProvider;
use routegate::pool::PoolConfig;
use routegate::provider::{Provider, ProviderImpl};
use routegate::proxy::ProxyServer;
use routegate::registry::RouteRegistry;
use routegate::route::RouteContext;
use routegate::task::{FinishReason, Task};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("routegate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let bind_ip: IpAddr = config.server.bind.parse().map_err(|e| {
        error!(bind = %config.server.bind, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e)
    })?;

    let agents = AgentClient::from_config(&config.agents)?;
    let registry = Arc::new(RouteRegistry::new());
    let resolver = Arc::new(DefaultResolver::new(agents.clone()));
    let ctx = RouteContext::new(Arc::clone(&registry), resolver)
        .with_agents(agents)
        .with_listen_host(bind_ip);

    let root = Task::root("routegate");

    let providers = build_providers(&config, &ctx);
    for provider in &providers {
        provider.start(&root).await;
    }
    info!(routes = registry.len(), "Initial routes started");

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let mut pool_stats = None;
    let entrypoint_handle = if config.server.port > 0 {
        let proxy = ProxyServer::new(
            SocketAddr::new(bind_ip, config.server.port),
            Arc::clone(&registry),
            pool_config,
            config.server.request_timeout,
        );
        pool_stats = Some(proxy.pool_stats());
        let entrypoint_task = root.subtask("entrypoint", true);
        let entrypoint_token = entrypoint_task.token();
        Some(entrypoint_task.spawn(async move {
            if let Err(e) = proxy.run(entrypoint_token).await {
                error!(error = %e, "Entrypoint error");
            }
        }))
    } else {
        info!("HTTP entrypoint disabled (port = 0)");
        None
    };

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        eprintln!("Admin API token: {} (set server.admin_token for a fixed value)", token);
        info!("Generated admin API token, printed to stderr");
        token
    });
    let mut admin_server = AdminServer::new(
        SocketAddr::from(([127, 0, 0, 1], config.server.admin_port)),
        Arc::clone(&registry),
        providers.clone(),
        admin_token,
    );
    if let Some(stats) = pool_stats {
        admin_server = admin_server.with_pool_stats(stats);
    }
    let admin_task = root.subtask("admin", true);
    let admin_cancel = admin_task.token();
    let admin_handle = admin_task.spawn(async move {
        if let Err(e) = admin_server.run(admin_cancel).await {
            error!(error = %e, "Admin server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading providers...");
                    for provider in &providers {
                        provider.reload().await;
                    }
                    info!(routes = registry.len(), "Providers reloaded");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let shutdown_timeout = config.server.shutdown_timeout;
    if tokio::time::timeout(shutdown_timeout, root.finish(FinishReason::cancelled("shutdown")))
        .await
        .is_err()
    {
        warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            remaining = root.num_children(),
            "Shutdown timed out, some tasks did not finish"
        );
    }
    registry.clear();

    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        if let Some(handle) = entrypoint_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn build_providers(config: &Config, ctx: &RouteContext) -> Vec<Arc<Provider>> {
    let mut sources: Vec<Arc<dyn ProviderImpl>> = Vec::new();

    for path in &config.providers.files {
        sources.push(Arc::new(FileProvider::new(path)));
    }

    let mut docker: Vec<_> = config.providers.docker.iter().collect();
    docker.sort_by(|a, b| a.0.cmp(b.0));
    for (name, docker_config) in docker {
        match DockerProvider::new(name.as_str(), docker_config.clone()) {
            Ok(source) => sources.push(Arc::new(source)),
            Err(e) => error!(provider = %name, host = %docker_config.host, error = %e, "Failed to create docker provider"),
        }
    }

    for name in &config.providers.agents {
        match ctx.agents.get(name) {
            Some(agent) => sources.push(Arc::new(AgentProvider::new(Arc::clone(agent)))),
            None => error!(agent = %name, "Agent provider refers to an unknown agent"),
        }
    }

    sources
        .into_iter()
        .map(|source| Provider::new(source, ctx.clone(), config.defaults.clone()))
        .collect()
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting route gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        request_timeout_secs = config.server.request_timeout.as_secs(),
        shutdown_timeout_secs = config.server.shutdown_timeout.as_secs(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        health_check_interval_ms = config.defaults.health_check_interval.as_millis() as u64,
        health_check_timeout_ms = config.defaults.health_check_timeout.as_millis() as u64,
        wake_timeout_secs = config.defaults.wake_timeout.as_secs(),
        stop_timeout_secs = config.defaults.stop_timeout.as_secs(),
        "Route defaults"
    );
    info!(
        files = ?config.providers.files,
        docker = ?config.providers.docker.keys().collect::<Vec<_>>(),
        agent_sources = ?config.providers.agents,
        agents = ?config.agents.keys().collect::<Vec<_>>(),
        "Configured providers"
    );
}
