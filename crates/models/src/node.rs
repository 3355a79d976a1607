use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Authoritative record for a connected node agent. Created on first
/// registration; never deleted by the core (admin deletion is external).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub status: NodeStatus,
    pub last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    pub protocol_version: u32,
    pub platform_metadata: serde_json::Value,
    pub invalid_payload_count: u64,
}

impl Node {
    pub fn new(node_id: impl Into<String>, protocol_version: u32, metadata: serde_json::Value) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Online,
            last_heartbeat_at: chrono::Utc::now(),
            protocol_version,
            platform_metadata: metadata,
            invalid_payload_count: 0,
        }
    }
}
