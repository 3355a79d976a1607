use crate::persistence::{HistoryRepository, HostRepository};
use chrono::Utc;
use cnc_models::events::AggregatorEvent;
use cnc_models::host::{Host, HostStats, HostStatus, HostStatusHistoryEntry, OpenPort, PortScanSnapshot, UptimeSummary};
use cnc_models::mac;
use std::collections::BTreeSet;
use std::sync::RwLock;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Receives aggregator events synchronously, in source order (§4.3
/// Events, §9: "a tagged-variant AggregatorEvent plus a bounded
/// subscriber registry works in any target"). Implementations must not
/// block; long work (HTTP delivery, broadcast fan-out) is handed off.
pub trait AggregatorEventSubscriber: Send + Sync {
    fn on_event(&self, event: &AggregatorEvent);
}

/// Authoritative view of hosts: MAC-based reconciliation, status history,
/// and synchronous event dispatch (§4.3). The only writer of host rows;
/// every other component reads value snapshots.
pub struct HostAggregator {
    hosts: HostRepository,
    history: HistoryRepository,
    port_scan_cache_ttl: Duration,
    subscribers: RwLock<Vec<std::sync::Arc<dyn AggregatorEventSubscriber>>>,
}

impl HostAggregator {
    pub fn new(hosts: HostRepository, history: HistoryRepository, port_scan_cache_ttl: Duration) -> Self {
        Self { hosts, history, port_scan_cache_ttl, subscribers: RwLock::new(Vec::new()) }
    }

    pub fn add_subscriber(&self, subscriber: std::sync::Arc<dyn AggregatorEventSubscriber>) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    fn emit(&self, event: AggregatorEvent) {
        for subscriber in self.subscribers.read().unwrap().iter() {
            subscriber.on_event(&event);
        }
    }

    /// Handles `host-discovered`/`host-updated` from a node (§4.3
    /// Reconciliation).
    #[instrument(skip(self, incoming))]
    pub async fn reconcile_host(&self, node_id: &str, mut incoming: Host) -> anyhow::Result<Host> {
        incoming.node_id = node_id.to_string();
        incoming.primary_mac = mac::canonicalize(&incoming.primary_mac)
            .ok_or_else(|| anyhow::anyhow!("invalid primary MAC '{}'", incoming.primary_mac))?;
        incoming.secondary_macs = incoming
            .secondary_macs
            .iter()
            .filter_map(|m| mac::canonicalize(m))
            .filter(|m| m != &incoming.primary_mac)
            .collect::<BTreeSet<_>>();

        let mut all_macs: BTreeSet<String> = incoming.secondary_macs.clone();
        all_macs.insert(incoming.primary_mac.clone());

        let matches = self.hosts.find_by_node_and_macs(node_id, &all_macs).await?;
        if let Some(existing) = matches.into_iter().next() {
            return self.update_existing(existing, incoming).await;
        }

        if let Some(existing) = self.hosts.find_by_node_and_name(node_id, &incoming.name).await? {
            return self.update_existing(existing, incoming).await;
        }

        incoming.id = Uuid::new_v4().to_string();
        incoming.last_seen_at = Utc::now();
        self.hosts.upsert(&incoming).await?;
        self.emit(AggregatorEvent::HostAdded { host: incoming.clone() });
        Ok(incoming)
    }

    async fn update_existing(&self, mut existing: Host, incoming: Host) -> anyhow::Result<Host> {
        let before = existing.clone();
        let old_status = existing.status;

        existing.name = incoming.name;
        existing.location = incoming.location;
        existing.primary_mac = incoming.primary_mac.clone();
        existing.secondary_macs = incoming.secondary_macs;
        existing.ip = incoming.ip;
        existing.status = incoming.status;
        existing.discovered = incoming.discovered;
        existing.ping_responsive = incoming.ping_responsive;
        existing.notes = incoming.notes;
        existing.tags = incoming.tags;
        existing.power_control = incoming.power_control;
        existing.last_seen_at = Utc::now();

        self.hosts.delete_other_rows_sharing_mac(&existing.node_id, &existing.primary_mac, &existing.id).await?;

        let meaningfully_changed = existing.differs_meaningfully(&before);

        self.hosts.upsert(&existing).await?;

        if meaningfully_changed {
            self.emit(AggregatorEvent::HostUpdated { host: existing.clone() });
            if existing.status != old_status {
                let entry = HostStatusHistoryEntry {
                    host_fqn: existing.fqn(),
                    old_status,
                    new_status: existing.status,
                    changed_at: Utc::now(),
                };
                self.history.record_transition(&entry).await?;
                self.emit(AggregatorEvent::HostStatusTransition {
                    host_fqn: entry.host_fqn.clone(),
                    old_status,
                    new_status: existing.status,
                });
            }
        }

        Ok(existing)
    }

    #[instrument(skip(self))]
    pub async fn remove_host(&self, node_id: &str, name: &str) -> anyhow::Result<()> {
        if let Some(host) = self.hosts.delete_by_node_and_name(node_id, name).await? {
            self.hosts.delete_other_rows_sharing_mac(node_id, &host.primary_mac, "").await?;
            self.emit(AggregatorEvent::HostRemoved { node_id: node_id.to_string(), name: name.to_string() });
        }
        Ok(())
    }

    /// Flips every awake host of `node_id` to asleep (§4.3 Unreachability,
    /// called on node disconnect per §4.1 Close).
    #[instrument(skip(self))]
    pub async fn mark_node_hosts_unreachable(&self, node_id: &str) -> anyhow::Result<u64> {
        let transitioned = self.hosts.mark_node_hosts_unreachable(node_id).await?;
        for host in &transitioned {
            self.history
                .record_transition(&HostStatusHistoryEntry {
                    host_fqn: host.fqn(),
                    old_status: HostStatus::Awake,
                    new_status: HostStatus::Asleep,
                    changed_at: Utc::now(),
                })
                .await?;
        }
        let count = transitioned.len() as u64;
        if count > 0 {
            self.emit(AggregatorEvent::NodeHostsUnreachable { node_id: node_id.to_string(), count });
        }
        Ok(count)
    }

    #[instrument(skip(self, open_ports))]
    pub async fn save_port_scan_snapshot(&self, host_id: &str, open_ports: Vec<OpenPort>, scanned_at: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        for port in &open_ports {
            port.validate().map_err(|e| anyhow::anyhow!(e))?;
        }
        let snapshot = PortScanSnapshot { open_ports, scanned_at, expire_at: scanned_at + chrono::Duration::from_std(self.port_scan_cache_ttl)? };
        self.hosts.save_port_scan_snapshot(host_id, &snapshot).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stats(&self) -> anyhow::Result<HostStats> {
        Ok(self.hosts.stats().await?)
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Host>> {
        Ok(self.hosts.get(id).await?)
    }

    pub async fn list_by_node(&self, node_id: &str) -> anyhow::Result<Vec<Host>> {
        Ok(self.hosts.list_by_node(node_id).await?)
    }

    /// Resolves a fully-qualified host name to its row. A fqn without a node
    /// suffix matches the first host sharing `(name, location)`, which is
    /// ambiguous when the same name/location pair exists on more than one
    /// node; a fqn carrying the `-<nodeId>` suffix (as `Host::fqn` always
    /// emits) disambiguates exactly (see `cnc_models::fqn`).
    #[instrument(skip(self))]
    pub async fn find_by_fqn(&self, fqn: &str) -> anyhow::Result<Option<Host>> {
        let parsed = cnc_models::fqn::Fqn::parse(fqn).map_err(|e| anyhow::anyhow!("invalid fqn '{fqn}': {e}"))?;
        Ok(self.hosts.list_all().await?.into_iter().find(|h| {
            h.name == parsed.name
                && h.location == parsed.location
                && parsed.node_id.as_deref().is_none_or(|node_id| h.node_id == node_id)
        }))
    }

    /// Replays history in `[now - period, now]`, with one prior transition
    /// to establish the opening status (§4.3 Uptime summary).
    #[instrument(skip(self))]
    pub async fn uptime_summary(&self, host_fqn: &str, period: Duration, current_status: HostStatus) -> anyhow::Result<UptimeSummary> {
        let window_end = Utc::now();
        let window_start = window_end - chrono::Duration::from_std(period)?;
        let entries = self.history.window_with_opening_state(host_fqn, window_start, window_end).await?;

        let mut awake_duration = chrono::Duration::zero();
        let mut cursor = window_start;
        let mut cursor_status = entries.first().map(|e| e.old_status).unwrap_or(current_status);
        let mut transition_count = 0u64;

        for entry in entries.iter().filter(|e| e.changed_at >= window_start) {
            if cursor_status == HostStatus::Awake {
                awake_duration += entry.changed_at - cursor;
            }
            cursor = entry.changed_at;
            cursor_status = entry.new_status;
            transition_count += 1;
        }
        if cursor_status == HostStatus::Awake {
            awake_duration += window_end - cursor;
        }

        let total = (window_end - window_start).num_milliseconds().max(1) as f64;
        let uptime_percent = ((awake_duration.num_milliseconds() as f64 / total) * 100.0 * 100.0).round() / 100.0;

        Ok(UptimeSummary { host_fqn: host_fqn.to_string(), window_start, window_end, uptime_percent, transition_count, current_status })
    }

    #[instrument(skip(self))]
    pub async fn prune_history(&self, retention_days: i64) -> anyhow::Result<u64> {
        Ok(self.history.prune_older_than(retention_days).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::client::DbClient;
    use cnc_models::host::PowerControlMetadata;

    async fn aggregator() -> HostAggregator {
        let db = DbClient::connect(":memory:", None).await.unwrap();
        HostAggregator::new(HostRepository::new(db.clone()), HistoryRepository::new(db), Duration::from_secs(3600))
    }

    fn sample_host(name: &str, mac: &str) -> Host {
        Host {
            id: String::new(),
            node_id: String::new(),
            name: name.to_string(),
            location: "lab".to_string(),
            primary_mac: mac.to_string(),
            secondary_macs: BTreeSet::new(),
            ip: Some("10.0.0.5".to_string()),
            status: HostStatus::Asleep,
            last_seen_at: Utc::now(),
            discovered: true,
            ping_responsive: None,
            notes: None,
            tags: vec![],
            power_control: Some(PowerControlMetadata { wol_port: Some(9), supports_sleep: false, supports_shutdown: false }),
            port_scan: None,
        }
    }

    #[tokio::test]
    async fn first_report_inserts_and_emits_host_added() {
        let agg = aggregator().await;
        let host = agg.reconcile_host("node-1", sample_host("desktop", "aa:bb:cc:dd:ee:ff")).await.unwrap();
        assert_eq!(host.primary_mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(agg.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn repeat_report_by_mac_updates_the_same_row() {
        let agg = aggregator().await;
        let first = agg.reconcile_host("node-1", sample_host("desktop", "aa:bb:cc:dd:ee:ff")).await.unwrap();

        let mut renamed = sample_host("desktop-renamed", "aa:bb:cc:dd:ee:ff");
        renamed.status = HostStatus::Awake;
        let second = agg.reconcile_host("node-1", renamed).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "desktop-renamed");
        assert_eq!(second.status, HostStatus::Awake);
        assert_eq!(agg.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn status_transition_is_recorded_in_history() {
        let agg = aggregator().await;
        agg.reconcile_host("node-1", sample_host("desktop", "aa:bb:cc:dd:ee:ff")).await.unwrap();

        let mut awake = sample_host("desktop", "aa:bb:cc:dd:ee:ff");
        awake.status = HostStatus::Awake;
        let host = agg.reconcile_host("node-1", awake).await.unwrap();

        let summary = agg.uptime_summary(&host.fqn(), Duration::from_secs(3600), HostStatus::Awake).await.unwrap();
        assert_eq!(summary.transition_count, 1);
    }

    #[tokio::test]
    async fn unreachable_flips_only_awake_hosts_of_that_node() {
        let agg = aggregator().await;
        let mut awake = sample_host("desktop", "aa:bb:cc:dd:ee:ff");
        awake.status = HostStatus::Awake;
        agg.reconcile_host("node-1", awake).await.unwrap();
        agg.reconcile_host("node-1", sample_host("laptop", "11:22:33:44:55:66")).await.unwrap();

        let flipped = agg.mark_node_hosts_unreachable("node-1").await.unwrap();
        assert_eq!(flipped, 1);
        assert_eq!(agg.stats().await.unwrap().awake, 0);
    }

    #[tokio::test]
    async fn removing_by_name_drops_the_host() {
        let agg = aggregator().await;
        agg.reconcile_host("node-1", sample_host("desktop", "aa:bb:cc:dd:ee:ff")).await.unwrap();
        agg.remove_host("node-1", "desktop").await.unwrap();
        assert_eq!(agg.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn invalid_mac_is_rejected() {
        let agg = aggregator().await;
        let err = agg.reconcile_host("node-1", sample_host("desktop", "not-a-mac")).await.unwrap_err();
        assert!(err.to_string().contains("invalid primary MAC"));
    }
}
