//! Process manager: launches backends on this machine for remote routers

use hostgate::config::Config;
use hostgate::launcher::InstanceLauncher;
use hostgate::provision::ProvisionServer;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive"))
                .add_directive("procman=debug".parse().expect("valid log directive")),
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

    let local_ip = config.local_ip().map_err(|e| {
        error!(error = %e, "Failed to determine local IP address");
        e
    })?;

    let port_range = config.ports.port_range()?;
    let addr = config.server.socket_addr(config.process_manager.port)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        local_ip,
        range = %port_range,
        probe_retries = config.probe.retries,
        "Starting process manager"
    );

    let launcher = InstanceLauncher::new(port_range, local_ip);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProvisionServer::new(addr, launcher.clone(), config.probe.probe_config(), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Process manager server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    launcher.stop_all().await;
    let _ = server_handle.await;

    info!("Shutdown complete");
    Ok(())
}
