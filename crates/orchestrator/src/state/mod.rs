pub mod host_aggregator;
pub mod inflight;
pub mod metrics;
pub mod node_registry;
pub mod stream_broker;

pub use host_aggregator::{AggregatorEventSubscriber, HostAggregator};
pub use inflight::{CommandOutcome, InflightTable};
pub use metrics::RuntimeMetrics;
pub use node_registry::{NodeConnection, NodeRegistry};
pub use stream_broker::StreamBroker;

use crate::config::Config;
use crate::persistence::{CommandRepository, DbClient, HistoryRepository, HostRepository, ScheduleRepository, WebhookRepository};
use crate::services::{CommandRouter, MacVendorCache, WebhookDispatcher};
use std::sync::Arc;

/// Everything a route handler or background task needs, grouped behind
/// `Arc`s so cloning `AppState` is cheap (§9: "shared, not re-derived,
/// per request").
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: DbClient,
    pub nodes: Arc<NodeRegistry>,
    pub hosts: Arc<HostAggregator>,
    pub streams: Arc<StreamBroker>,
    pub inflight: Arc<InflightTable>,
    pub metrics: Arc<RuntimeMetrics>,
    pub commands: Arc<CommandRepository>,
    pub schedules: Arc<ScheduleRepository>,
    pub webhooks: Arc<WebhookRepository>,
    pub router: Arc<CommandRouter>,
    pub webhook_dispatcher: Arc<WebhookDispatcher>,
    pub mac_vendor: Arc<MacVendorCache>,
    /// Flips to `true` once on graceful shutdown; every live WebSocket
    /// handler holds a clone and watches it to close its connection with
    /// the shutdown close codes (§5 Cancellation).
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

impl AppState {
    pub fn new(config: Config, db: DbClient, shutdown: tokio::sync::watch::Receiver<bool>) -> Self {
        let config = Arc::new(config);
        let hosts = Arc::new(HostAggregator::new(
            HostRepository::new(db.clone()),
            HistoryRepository::new(db.clone()),
            config.port_scan_cache_ttl,
        ));
        let streams = Arc::new(StreamBroker::new());
        hosts.add_subscriber(streams.clone() as Arc<dyn AggregatorEventSubscriber>);

        let webhooks_repo = Arc::new(WebhookRepository::new(db.clone()));
        let webhook_dispatcher = Arc::new(WebhookDispatcher::new(config.clone(), webhooks_repo.clone()));
        hosts.add_subscriber(webhook_dispatcher.clone() as Arc<dyn AggregatorEventSubscriber>);

        let nodes = Arc::new(NodeRegistry::new());
        let commands = Arc::new(CommandRepository::new(db.clone()));
        let inflight = Arc::new(InflightTable::new());
        let metrics = Arc::new(RuntimeMetrics::new());

        let router = Arc::new(CommandRouter::new(
            config.clone(),
            nodes.clone(),
            hosts.clone(),
            commands.clone(),
            inflight.clone(),
            metrics.clone(),
            streams.clone(),
            webhook_dispatcher.clone(),
        ));

        let mac_vendor = Arc::new(MacVendorCache::new(config.mac_vendor_cache_ttl, config.mac_vendor_cache_capacity));

        Self {
            nodes,
            hosts,
            streams,
            inflight,
            metrics,
            commands,
            schedules: Arc::new(ScheduleRepository::new(db.clone())),
            webhooks: webhooks_repo,
            router,
            webhook_dispatcher,
            mac_vendor,
            shutdown,
            config,
            db,
        }
    }
}
