//! Edgewatch panel.
//!
//! Central HTTP server that discovers, polls, stores, analyzes and
//! controls a fleet of edge proxy nodes.

use edge_panel::alerter::Alerter;
use edge_panel::anomaly::AnomalyAnalyzer;
use edge_panel::api::{self, PanelState};
use edge_panel::blocklist::BlocklistSync;
use edge_panel::collector::FleetCollector;
use edge_panel::config::PanelConfig;
use edge_panel::node_client::NodeClient;
use edge_panel::store;
use edge_panel::xray_aggregator::XrayAggregator;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edge_panel=debug".into()),
        )
        .init();

    let config = PanelConfig::load()?;
    let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;

    info!("initializing edgewatch panel...");
    let pool = store::open(&config.database_path).await?;

    let collector = FleetCollector::new(pool.clone())?;
    let aggregator = XrayAggregator::new(pool.clone())?;
    let blocklist = BlocklistSync::new(pool.clone())?;
    let alerter = Alerter::new(pool.clone());
    let analyzer = AnomalyAnalyzer::new(pool.clone());

    collector.start().await;
    aggregator.start().await;
    blocklist.start().await;
    alerter.start().await;
    analyzer.start().await;

    let state = PanelState {
        pool,
        config: Arc::new(config),
        collector: collector.clone(),
        aggregator: aggregator.clone(),
        blocklist: blocklist.clone(),
        alerter: alerter.clone(),
        analyzer: analyzer.clone(),
        node_client: NodeClient::new()?,
    };

    let app = api::router(state);

    info!("starting panel on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down background services");
            analyzer.stop().await;
            alerter.stop().await;
            blocklist.stop().await;
            aggregator.stop().await;
            collector.stop().await;
        })
        .await?;

    Ok(())
}
