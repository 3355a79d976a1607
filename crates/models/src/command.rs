use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Wake,
    SleepHost,
    ShutdownHost,
    Scan,
    ScanHostPorts,
    PingHost,
    UpdateHost,
    DeleteHost,
}

impl CommandType {
    /// Mutating commands are serialized per host (§4.2); read-like commands
    /// (ping, scan-ports) may interleave.
    pub fn is_mutating(self) -> bool {
        !matches!(self, CommandType::PingHost | CommandType::ScanHostPorts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Sent,
    Acknowledged,
    Failed,
    TimedOut,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Acknowledged | CommandState::Failed | CommandState::TimedOut)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub command_type: CommandType,
    pub node_id: String,
    pub target: String,
    pub payload: serde_json::Value,
    pub state: CommandState,
    pub correlation_id: String,
    pub idempotency_key: Option<String>,
    pub queued_at: chrono::DateTime<chrono::Utc>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
    pub outcome: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Command {
    pub fn new(
        command_type: CommandType,
        node_id: impl Into<String>,
        target: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: String,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type,
            node_id: node_id.into(),
            target: target.into(),
            payload,
            state: CommandState::Queued,
            correlation_id,
            idempotency_key,
            queued_at: chrono::Utc::now(),
            sent_at: None,
            resolved_at: None,
            outcome: None,
            error: None,
        }
    }

    /// Key for the idempotency dedup map: `(node, type, target, key)`.
    pub fn dedup_key(&self) -> Option<(String, CommandType, String, String)> {
        self.idempotency_key
            .clone()
            .map(|key| (self.node_id.clone(), self.command_type, self.target.clone(), key))
    }
}

/// Synthesizes a correlation id with the conventional `corr_` prefix when
/// the caller did not supply one (§9 Design Notes).
pub fn correlation_id_or_default(supplied: Option<String>) -> String {
    supplied.unwrap_or_else(|| format!("corr_{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutating_classification_matches_spec_table() {
        assert!(CommandType::Wake.is_mutating());
        assert!(CommandType::SleepHost.is_mutating());
        assert!(CommandType::ShutdownHost.is_mutating());
        assert!(CommandType::UpdateHost.is_mutating());
        assert!(CommandType::DeleteHost.is_mutating());
        assert!(!CommandType::PingHost.is_mutating());
        assert!(!CommandType::ScanHostPorts.is_mutating());
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(CommandState::Acknowledged.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(CommandState::TimedOut.is_terminal());
        assert!(!CommandState::Queued.is_terminal());
        assert!(!CommandState::Sent.is_terminal());
    }

    #[test]
    fn correlation_id_is_synthesized_with_prefix_when_absent() {
        let id = correlation_id_or_default(None);
        assert!(id.starts_with("corr_"));
        assert_eq!(correlation_id_or_default(Some("caller-id".into())), "caller-id");
    }
}
