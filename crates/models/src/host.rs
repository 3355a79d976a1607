use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Awake,
    Asleep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: String,
    pub service: String,
}

impl OpenPort {
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be in 1..=65535".into());
        }
        if self.protocol != "tcp" {
            return Err(format!("unsupported protocol '{}'", self.protocol));
        }
        if self.service.is_empty() {
            return Err("service must be non-empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortScanSnapshot {
    pub open_ports: Vec<OpenPort>,
    pub scanned_at: chrono::DateTime<chrono::Utc>,
    pub expire_at: chrono::DateTime<chrono::Utc>,
}

impl PortScanSnapshot {
    pub fn is_fresh(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now < self.expire_at
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerControlMetadata {
    pub wol_port: Option<u16>,
    pub supports_sleep: bool,
    pub supports_shutdown: bool,
}

/// A row in the aggregator's canonical host table. Identity is
/// `(node_id, primary_mac)`; `fqn()` derives the externally-visible key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub location: String,
    pub primary_mac: String,
    pub secondary_macs: BTreeSet<String>,
    pub ip: Option<String>,
    pub status: HostStatus,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub discovered: bool,
    pub ping_responsive: Option<bool>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub power_control: Option<PowerControlMetadata>,
    pub port_scan: Option<PortScanSnapshot>,
}

impl Host {
    pub fn fqn(&self) -> String {
        crate::fqn::Fqn::build(&self.name, &self.location, Some(&self.node_id))
    }

    pub fn all_macs(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.primary_mac).chain(self.secondary_macs.iter())
    }

    /// True if any field that a read-side consumer could observe differs.
    /// Drives the "meaningful change" test in host reconciliation (§4.3).
    pub fn differs_meaningfully(&self, other: &Host) -> bool {
        self.name != other.name
            || self.primary_mac != other.primary_mac
            || self.secondary_macs != other.secondary_macs
            || self.ip != other.ip
            || self.status != other.status
            || self.discovered != other.discovered
            || self.ping_responsive != other.ping_responsive
            || self.notes != other.notes
            || power_control_json(&self.power_control) != power_control_json(&other.power_control)
            || self.location != other.location
            || self.tags != other.tags
    }

    /// Returns the port scan snapshot only if it has not expired.
    pub fn visible_port_scan(&self, now: chrono::DateTime<chrono::Utc>) -> Option<&PortScanSnapshot> {
        self.port_scan.as_ref().filter(|s| s.is_fresh(now))
    }
}

fn power_control_json(p: &Option<PowerControlMetadata>) -> Option<String> {
    p.as_ref().and_then(|p| serde_json::to_string(p).ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatusHistoryEntry {
    pub host_fqn: String,
    pub old_status: HostStatus,
    pub new_status: HostStatus,
    pub changed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStats {
    pub total: u64,
    pub awake: u64,
    pub asleep: u64,
    pub by_location: std::collections::BTreeMap<String, LocationStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationStats {
    pub total: u64,
    pub awake: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeSummary {
    pub host_fqn: String,
    pub window_start: chrono::DateTime<chrono::Utc>,
    pub window_end: chrono::DateTime<chrono::Utc>,
    pub uptime_percent: f64,
    pub transition_count: u64,
    pub current_status: HostStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Host {
        Host {
            id: "h1".into(),
            node_id: "n1".into(),
            name: "desktop".into(),
            location: "lab".into(),
            primary_mac: "AA:BB:CC:DD:EE:FF".into(),
            secondary_macs: BTreeSet::new(),
            ip: Some("10.0.0.5".into()),
            status: HostStatus::Awake,
            last_seen_at: chrono::Utc::now(),
            discovered: true,
            ping_responsive: Some(true),
            notes: None,
            tags: vec![],
            power_control: None,
            port_scan: None,
        }
    }

    #[test]
    fn unchanged_clone_is_not_meaningfully_different() {
        let h = sample();
        assert!(!h.differs_meaningfully(&h.clone()));
    }

    #[test]
    fn status_flip_is_meaningful() {
        let h = sample();
        let mut other = h.clone();
        other.status = HostStatus::Asleep;
        assert!(h.differs_meaningfully(&other));
    }

    #[test]
    fn expired_snapshot_is_not_visible() {
        let mut h = sample();
        let now = chrono::Utc::now();
        h.port_scan = Some(PortScanSnapshot {
            open_ports: vec![],
            scanned_at: now - chrono::Duration::hours(5),
            expire_at: now - chrono::Duration::hours(1),
        });
        assert!(h.visible_port_scan(now).is_none());
    }
}
