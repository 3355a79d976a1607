use cnc_models::node::{Node, NodeStatus};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Outbound write half for a single node channel. Writes are serialized
/// through the `mpsc::Sender` so frames never interleave (§9 per-connection
/// send serialization); the channel's consuming task owns the actual
/// socket. `closer` lets a full outbound queue force the connection closed
/// with a specific code/reason instead of blocking the dispatching task
/// (§4.1 overflow, §5).
#[derive(Clone)]
pub struct NodeConnection {
    pub node_id: String,
    pub sender: mpsc::Sender<String>,
    pub closer: mpsc::Sender<(u16, &'static str)>,
}

/// Owns the live channel map and per-node record. Exactly one writer: the
/// node session manager (§3 Ownership). The command router only reads
/// through `send_to`.
pub struct NodeRegistry {
    connections: RwLock<HashMap<String, NodeConnection>>,
    nodes: RwLock<HashMap<String, Node>>,
    per_ip_node_channels: RwLock<HashMap<IpAddr, usize>>,
    per_ip_subscriber_channels: RwLock<HashMap<IpAddr, usize>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            per_ip_node_channels: RwLock::new(HashMap::new()),
            per_ip_subscriber_channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_channel_count_for_ip(&self, ip: IpAddr) -> usize {
        *self.per_ip_node_channels.read().unwrap().get(&ip).unwrap_or(&0)
    }

    pub fn subscriber_channel_count_for_ip(&self, ip: IpAddr) -> usize {
        *self.per_ip_subscriber_channels.read().unwrap().get(&ip).unwrap_or(&0)
    }

    pub fn increment_node_channel(&self, ip: IpAddr) {
        *self.per_ip_node_channels.write().unwrap().entry(ip).or_insert(0) += 1;
    }

    pub fn decrement_node_channel(&self, ip: IpAddr) {
        let mut counters = self.per_ip_node_channels.write().unwrap();
        if let Some(count) = counters.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.remove(&ip);
            }
        }
    }

    pub fn increment_subscriber_channel(&self, ip: IpAddr) {
        *self.per_ip_subscriber_channels.write().unwrap().entry(ip).or_insert(0) += 1;
    }

    pub fn decrement_subscriber_channel(&self, ip: IpAddr) {
        let mut counters = self.per_ip_subscriber_channels.write().unwrap();
        if let Some(count) = counters.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.remove(&ip);
            }
        }
    }

    /// Registers a freshly authenticated channel as authoritative for
    /// `node_id`, evicting (by returning) any prior connection so the
    /// caller can close it with `policy-replaced` (§4.1 registration
    /// protocol).
    #[instrument(skip(self, connection))]
    pub fn register(&self, node_id: &str, connection: NodeConnection, protocol_version: u32, metadata: serde_json::Value) -> Option<NodeConnection> {
        let previous = self.connections.write().unwrap().insert(node_id.to_string(), connection);
        if previous.is_some() {
            warn!(node_id, "evicting prior channel for reconnecting node");
        }

        let mut nodes = self.nodes.write().unwrap();
        nodes
            .entry(node_id.to_string())
            .and_modify(|node| {
                node.status = NodeStatus::Online;
                node.protocol_version = protocol_version;
                node.platform_metadata = metadata.clone();
                node.last_heartbeat_at = chrono::Utc::now();
            })
            .or_insert_with(|| Node::new(node_id, protocol_version, metadata));

        info!(node_id, "node registered");
        previous
    }

    pub fn record_heartbeat(&self, node_id: &str) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(node_id) {
            node.last_heartbeat_at = chrono::Utc::now();
        }
    }

    pub fn increment_invalid_payload_count(&self, node_id: &str) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(node_id) {
            node.invalid_payload_count += 1;
        }
    }

    /// Marks offline and removes the live channel, returning it only if it
    /// is still the connection the caller observed (avoids closing a
    /// channel that already got replaced).
    pub fn mark_offline_if_current(&self, node_id: &str, observed_sender: &mpsc::Sender<String>) -> bool {
        let mut connections = self.connections.write().unwrap();
        let is_current = connections.get(node_id).map(|c| c.sender.same_channel(observed_sender)).unwrap_or(false);
        if is_current {
            connections.remove(node_id);
        }
        if let Some(node) = self.nodes.write().unwrap().get_mut(node_id) {
            node.status = NodeStatus::Offline;
        }
        is_current
    }

    pub fn connection(&self, node_id: &str) -> Option<NodeConnection> {
        self.connections.read().unwrap().get(node_id).cloned()
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.connections.read().unwrap().contains_key(node_id)
    }

    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().unwrap().get(node_id).cloned()
    }

    pub fn connected_node_ids(&self) -> Vec<String> {
        self.connections.read().unwrap().keys().cloned().collect()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
