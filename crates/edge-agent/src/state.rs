//! Application root: every driver is constructed once here and shared
//! through the router state. No ambient singletons.

use crate::config::AgentConfig;
use crate::security::SecurityManager;
use edge_exec::{HostExecutor, HostRunner, NsenterRunner};
use edge_haproxy::{HaproxyDriver, HaproxyPaths};
use edge_metrics::MetricsProducer;
use edge_network::{FirewallDriver, IpsetDriver};
use edge_traffic::{TrafficAccountant, TrafficConfig};
use edge_xray::{TorrentBlocker, XrayLogIngester};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub executor: Arc<HostExecutor>,
    pub firewall: Arc<FirewallDriver>,
    pub ipset: Arc<IpsetDriver>,
    pub haproxy: Arc<HaproxyDriver>,
    pub traffic: Arc<TrafficAccountant>,
    pub ingester: Arc<XrayLogIngester>,
    pub blocker: Arc<TorrentBlocker>,
    pub metrics: Arc<MetricsProducer>,
    pub security: Arc<SecurityManager>,
}

impl AppState {
    pub async fn build(config: AgentConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let runner: Arc<dyn HostRunner> = Arc::new(NsenterRunner::new());
        let executor = Arc::new(HostExecutor::new());

        let firewall = Arc::new(FirewallDriver::new(runner.clone()));
        let ipset = Arc::new(IpsetDriver::new(runner.clone()));
        let haproxy = Arc::new(HaproxyDriver::new(
            executor.clone(),
            firewall.clone(),
            HaproxyPaths {
                config_path: config.haproxy_config.clone(),
                certs_dir: config.haproxy_certs.clone(),
                ..HaproxyPaths::default()
            },
        ));

        let traffic = TrafficAccountant::init(
            runner.clone(),
            TrafficConfig {
                db_path: config.traffic_db_path.clone(),
                collect_interval: config.traffic_collect_interval,
                retention_days: config.traffic_retention_days,
                ..TrafficConfig::default()
            },
        )
        .await?;

        let ingester = Arc::new(XrayLogIngester::new());
        let blocker = Arc::new(TorrentBlocker::new(ipset.clone(), runner.clone()));
        let metrics = Arc::new(MetricsProducer::new(
            &config.node_name,
            Some(haproxy.clone()),
        ));
        let security = Arc::new(SecurityManager::new(
            config.security_max_failed_attempts,
            config.security_ban_duration,
        ));

        Ok(Self {
            config,
            executor,
            firewall,
            ipset,
            haproxy,
            traffic,
            ingester,
            blocker,
            metrics,
            security,
        })
    }

    /// Bring up everything that runs in the background.
    pub async fn start_background(&self) {
        if let Err(e) = self.ipset.init().await {
            tracing::warn!("ipset init failed (will retry on first use): {}", e);
        }
        let _ = self.haproxy.init_config();
        self.traffic.start().await;
        self.ingester.start().await;
        self.blocker.auto_start_if_enabled().await;
    }

    pub async fn shutdown(&self) {
        self.ingester.stop().await;
        self.blocker.graceful_stop().await;
        self.traffic.stop().await;
    }
}
