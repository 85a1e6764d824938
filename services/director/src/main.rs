//! Director
//!
//! Runs the dynamic sidecar scheduler and its operator API.

use std::sync::Arc;

use anyhow::{Context, Result};
use dynsched_director::{
    api,
    config::Config,
    instrumentation::TracingPublisher,
    node_rights::NodeRightsManager,
    projects::InMemoryProjects,
    scheduler::{Scheduler, SchedulerContext},
    sidecar::SidecarClient,
    state::AppState,
};
use dynsched_swarm::DockerClient;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // prefer RUST_LOG, fall back to DIRECTOR_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting director");
    info!(
        listen_addr = %config.listen_addr,
        swarm_stack_name = %config.swarm_stack_name,
        "Configuration loaded"
    );

    let docker = DockerClient::new(&config.docker_socket);
    if !docker.socket_exists() {
        warn!(socket = %config.docker_socket.display(), "Docker socket not found");
    }

    let sidecar = SidecarClient::new(config.scheduler.api_client_timeout)
        .context("failed to build the sidecar client")?;
    let node_rights = NodeRightsManager::from_config(&config.node_rights)
        .await
        .context("failed to set up node rights")?;

    let scheduler = Scheduler::new(SchedulerContext {
        config: config.clone(),
        swarm: Arc::new(docker),
        sidecar: Arc::new(sidecar),
        node_rights: Arc::new(node_rights),
        projects: Arc::new(InMemoryProjects::permissive()),
        events: Arc::new(TracingPublisher),
    });
    if let Err(e) = scheduler.start().await {
        error!(error = %e, "Failed to start the scheduler");
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = api::create_router(AppState::new(scheduler.clone()));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    scheduler.stop().await;

    info!("Director shutdown complete");
    Ok(())
}
