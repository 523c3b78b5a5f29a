//! HTTP server setup and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::http_server::build_router;
use crate::service::OrchestratorService;

/// Run the HTTP server until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let service = Arc::new(OrchestratorService::from_config(&config)?);

    // Check hypervisor health
    let health = {
        let service = service.clone();
        tokio::task::spawn_blocking(move || service.health()).await?
    };
    if health.healthy {
        info!(
            backend = service.backend(),
            uri = %health.uri,
            domains = health.domains,
            "Hypervisor reachable"
        );
    } else {
        warn!(
            backend = service.backend(),
            uri = %health.uri,
            "Hypervisor unreachable, requests will fail until it comes back"
        );
    }

    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let app = build_router(service);

    info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
