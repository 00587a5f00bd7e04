use hostgate::config::{Config, ProvisioningMode};
use hostgate::launcher::InstanceLauncher;
use hostgate::pool::{ConnectionPool, PoolConfig};
use hostgate::provision::{Provisioner, RemoteProvisioner};
use hostgate::proxy::ProxyServer;
use hostgate::registry::{self, Registry, SharedRegistry};
use hostgate::router::Router;
use hostgate::tls;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
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

    let local_ip = config.local_ip().map_err(|e| {
        error!(error = %e, "Failed to determine local IP address");
        e
    })?;

    print_startup_banner(&config, &local_ip);

    let registry = open_registry(&config).await?;

    let port_range = config.ports.port_range()?;
    let launcher = InstanceLauncher::with_registry(port_range, local_ip.clone(), Arc::clone(&registry));

    let provisioner: Arc<dyn Provisioner> = match config.provisioning.mode {
        ProvisioningMode::Local => Arc::new(launcher.clone()),
        ProvisioningMode::Remote => {
            let peer = config
                .provisioning
                .peer
                .clone()
                .ok_or_else(|| anyhow::anyhow!("provisioning.peer is required in remote mode"))?;
            info!(peer = %peer, "Delegating instance creation to process manager");
            Arc::new(RemoteProvisioner::new(peer)?)
        }
    };

    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        provisioner,
        local_ip,
        config.probe.probe_config(),
    ));

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    }));

    let tls_acceptor = if config.server.tls_enabled() {
        let apps = match registry.tls_applications().await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "Unable to load TLS applications from registry");
                Vec::new()
            }
        };
        let resolver = tls::build_resolver(&config.server, &apps)?;
        Some(tls::acceptor(resolver)?)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_handle = if config.server.port > 0 {
        let addr = config.server.socket_addr(config.server.port)?;
        let proxy = ProxyServer::new(addr, Arc::clone(&router), Arc::clone(&pool), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }))
    } else {
        None
    };

    let https_handle = match tls_acceptor {
        Some(acceptor) => {
            let addr = config.server.socket_addr(config.server.tls_port)?;
            let proxy = ProxyServer::new(addr, Arc::clone(&router), Arc::clone(&pool), shutdown_rx.clone())
                .with_tls(acceptor);
            Some(tokio::spawn(async move {
                if let Err(e) = proxy.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }))
        }
        None => None,
    };

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    info!("Stopping all backends...");
    launcher.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
    })
    .await;

    let stats = pool.stats();
    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Connect the registry and upsert the seed applications from the config
async fn open_registry(config: &Config) -> anyhow::Result<SharedRegistry> {
    let url = config.registry.url.as_str();
    let seeds = &config.registry.applications;

    let registry = registry::connect(url)?;
    registry.seed(seeds).await?;

    info!(url, seeded = seeds.len(), "Application registry connected");
    Ok(registry)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config, local_ip: &str) {
    info!(name = PKG_NAME, version = VERSION, "Starting router");
    info!(
        bind = %config.server.bind,
        http_port = if config.server.port > 0 { Some(config.server.port) } else { None },
        https_port = if config.server.tls_enabled() { Some(config.server.tls_port) } else { None },
        local_ip,
        "Server configuration"
    );
    info!(
        range = %config.ports.range,
        probe_retries = config.probe.retries,
        probe_initial_delay_ms = config.probe.initial_delay_ms,
        provisioning = ?config.provisioning.mode,
        "Provisioning settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
}
