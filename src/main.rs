use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arena_instance_server::config::ServerConfig;
use arena_instance_server::metrics::{self, Metrics};
use arena_instance_server::net::process_manager::{run_manager, ProcessManager};
use arena_instance_server::net::transport::TcpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Arena Instance Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {}:{}, workers={}, tick={}ms",
        config.bind_address, config.port, config.worker_count, config.tick_interval_ms
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let transport = Arc::new(TcpTransport::new(metrics.clone()));
    let (manager, events) = ProcessManager::new(config.clone(), transport.clone(), metrics.clone());
    let manager = Arc::new(RwLock::new(manager));
    tokio::spawn(run_manager(
        manager.clone(),
        events,
        config.host_flush_interval(),
    ));

    let listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port)).await?;
    info!("Server ready on {}", listener.local_addr()?);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = transport.run(listener, manager.clone()) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    manager.write().await.shutdown();
    info!("Server stopped");

    Ok(())
}
