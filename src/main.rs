use mcpgate::config::Config;
use mcpgate::http::{GatewayServer, PKG_NAME, VERSION};
use mcpgate::proxy::ProxyManager;
use mcpgate::session::{run_reaper, SessionRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mcpgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start all backends; failures are logged and skipped
    let manager = ProxyManager::new();
    manager
        .start_all(&config.servers, config.handshake_timeout())
        .await;

    let registry = SessionRegistry::new();

    // Spawn the idle reaper
    tokio::spawn(run_reaper(
        Arc::clone(&registry),
        config.session_idle_timeout(),
        config.sweep_interval(),
        shutdown_rx.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.bind, port = config.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Binding failure is fatal; later accept errors are not
    let server = GatewayServer::bind(
        addr,
        Arc::clone(&manager),
        Arc::clone(&registry),
        config.session_idle_timeout(),
        shutdown_rx.clone(),
    )
    .await?;

    info!("Available endpoints:");
    for name in manager.backend_names() {
        info!("  -> http://{}/mcp/{}", addr, name);
    }
    info!("  -> http://{}/health", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all backends
    info!("Stopping all backends...");
    manager.stop_all(config.shutdown_grace_period()).await;

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting MCP gateway");
    info!(bind = %config.bind, port = config.port, "Server configuration");
    info!(
        session_idle_timeout_secs = config.session_idle_timeout_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        "Session reaping settings"
    );
    info!(
        handshake_timeout_secs = config.handshake_timeout_secs,
        shutdown_grace_period_secs = config.shutdown_grace_period_secs,
        "Backend lifecycle settings"
    );
    info!(
        server_count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "Configured backend servers"
    );
}
