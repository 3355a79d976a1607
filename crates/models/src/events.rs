//! In-process event types emitted by the host aggregator and the command
//! router, consumed synchronously by the stream broker and the webhook
//! dispatcher (§4.3, §4.4, §9: "model as a tagged-variant event, not
//! unbounded dynamic subscription").

use crate::host::{Host, HostStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AggregatorEvent {
    HostAdded { host: Host },
    HostUpdated { host: Host },
    HostRemoved { node_id: String, name: String },
    HostStatusTransition { host_fqn: String, old_status: HostStatus, new_status: HostStatus },
    NodeHostsUnreachable { node_id: String, count: u64 },
    NodeHostsRemoved { node_id: String, count: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WakeVerificationStatus {
    Verified,
    Unreachable,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeVerificationComplete {
    pub command_id: String,
    pub fqn: String,
    pub status: WakeVerificationStatus,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub source: String,
}

/// The wire shape delivered to subscribers over the stream channel (§6).
/// `changed` lets clients skip refetching on housekeeping events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub changed: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: Option<serde_json::Value>,
}

impl StreamEvent {
    pub fn mutating(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            changed: true,
            timestamp: chrono::Utc::now(),
            payload: Some(payload),
        }
    }

    pub fn housekeeping(event_type: &str, payload: Option<serde_json::Value>) -> Self {
        Self {
            event_type: event_type.to_string(),
            changed: false,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    pub fn from_aggregator_event(event: &AggregatorEvent) -> Self {
        match event {
            AggregatorEvent::HostAdded { host } => {
                Self::mutating("host.discovered", serde_json::json!({ "host": host }))
            }
            AggregatorEvent::HostUpdated { host } => {
                Self::mutating("host.updated", serde_json::json!({ "host": host }))
            }
            AggregatorEvent::HostRemoved { node_id, name } => {
                Self::mutating("host.removed", serde_json::json!({ "nodeId": node_id, "name": name }))
            }
            AggregatorEvent::HostStatusTransition { .. } => {
                Self::mutating("hosts.changed", serde_json::to_value(event).unwrap())
            }
            AggregatorEvent::NodeHostsUnreachable { .. } => {
                Self::mutating("hosts.changed", serde_json::to_value(event).unwrap())
            }
            AggregatorEvent::NodeHostsRemoved { .. } => {
                Self::mutating("hosts.changed", serde_json::to_value(event).unwrap())
            }
        }
    }

    pub fn from_wake_verification(event: &WakeVerificationComplete) -> Self {
        Self::mutating("wake.verified", serde_json::to_value(event).unwrap())
    }
}
