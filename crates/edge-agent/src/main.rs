//! Edgewatch node agent.
//!
//! Runs inside a privileged container (pid: host) on each edge server,
//! exposing an authenticated HTTP API that mediates HAProxy, UFW, ipset,
//! traffic accounting and Xray log processing on the host.

mod config;
mod error;
mod routes;
mod security;
mod state;

use config::AgentConfig;
use state::AppState;
use std::net::SocketAddr;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edge_agent=debug".into()),
        )
        .init();

    let config = AgentConfig::load()?;
    let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;

    info!("initializing edgewatch node agent...");
    let state = AppState::build(config).await?;
    state.start_background().await;

    let app = routes::router(state.clone());

    info!("starting node agent on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down: stopping log tail and flushing state");
    state.shutdown().await;
}
