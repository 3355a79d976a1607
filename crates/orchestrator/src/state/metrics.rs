use cnc_models::command::CommandType;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const RESOLVED_RING_CAPACITY: usize = 200;

const TRACKED_TYPES: &[CommandType] = &[
    CommandType::Wake,
    CommandType::Scan,
    CommandType::ScanHostPorts,
    CommandType::UpdateHost,
    CommandType::DeleteHost,
    CommandType::PingHost,
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandTypeCounters {
    pub dispatched: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub completed: u64,
    pub cumulative_latency_ms: u64,
    pub last_latency_ms: u64,
}

impl CommandTypeCounters {
    fn active(&self) -> u64 {
        self.dispatched.saturating_sub(self.acknowledged + self.failed + self.timed_out)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntry {
    pub command_id: String,
    pub correlation_id: String,
    pub outcome: String,
    pub resolved_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub commands: HashMap<String, CommandTypeCounters>,
    pub unknown: CommandTypeCounters,
    pub recent_resolved: Vec<ResolvedEntry>,
}

/// In-memory counters and a bounded correlation trail (§4.7). Snapshot
/// shape is stable across restarts: it does not persist, it is rebuilt
/// empty on boot like the rest of the runtime's volatile state.
pub struct RuntimeMetrics {
    counters: RwLock<HashMap<CommandType, CommandTypeCounters>>,
    unknown: RwLock<CommandTypeCounters>,
    recent_resolved: RwLock<VecDeque<ResolvedEntry>>,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        let mut counters = HashMap::new();
        for t in TRACKED_TYPES {
            counters.insert(*t, CommandTypeCounters::default());
        }
        Self { counters: RwLock::new(counters), unknown: RwLock::new(CommandTypeCounters::default()), recent_resolved: RwLock::new(VecDeque::new()) }
    }

    pub fn record_dispatch(&self, command_type: CommandType) {
        if let Some(counters) = self.counters.write().unwrap().get_mut(&command_type) {
            counters.dispatched += 1;
        }
    }

    pub fn record_resolution(&self, command_id: &str, correlation_id: &str, command_type: Option<CommandType>, outcome: &str, latency_ms: u64) {
        {
            let mut counters_guard = self.counters.write().unwrap();
            let mut unknown_guard = self.unknown.write().unwrap();
            let target = match command_type.and_then(|t| counters_guard.get_mut(&t)) {
                Some(counters) => counters,
                None => &mut unknown_guard,
            };
            match outcome {
                "acknowledged" => target.acknowledged += 1,
                "failed" => target.failed += 1,
                "timed_out" => target.timed_out += 1,
                _ => {}
            }
            target.completed += 1;
            target.cumulative_latency_ms += latency_ms;
            target.last_latency_ms = latency_ms;
        }

        let mut ring = self.recent_resolved.write().unwrap();
        if ring.len() >= RESOLVED_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(ResolvedEntry {
            command_id: command_id.to_string(),
            correlation_id: correlation_id.to_string(),
            outcome: outcome.to_string(),
            resolved_at_ms: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read().unwrap();
        let commands = counters.iter().map(|(t, c)| (type_str(*t).to_string(), c.clone())).collect();
        MetricsSnapshot {
            commands,
            unknown: self.unknown.read().unwrap().clone(),
            recent_resolved: self.recent_resolved.read().unwrap().iter().cloned().collect(),
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn type_str(t: CommandType) -> &'static str {
    match t {
        CommandType::Wake => "wake",
        CommandType::SleepHost => "sleep-host",
        CommandType::ShutdownHost => "shutdown-host",
        CommandType::Scan => "scan",
        CommandType::ScanHostPorts => "scan-host-ports",
        CommandType::PingHost => "ping-host",
        CommandType::UpdateHost => "update-host",
        CommandType::DeleteHost => "delete-host",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatched_equals_sum_of_terminal_and_active() {
        let metrics = RuntimeMetrics::new();
        metrics.record_dispatch(CommandType::Wake);
        metrics.record_dispatch(CommandType::Wake);
        metrics.record_resolution("c1", "corr1", Some(CommandType::Wake), "acknowledged", 10);

        let snapshot = metrics.snapshot();
        let wake = &snapshot.commands["wake"];
        assert_eq!(wake.dispatched, 2);
        assert_eq!(wake.acknowledged, 1);
        assert_eq!(wake.active(), 1);
    }

    #[test]
    fn unattributed_outcome_goes_to_unknown_bucket() {
        let metrics = RuntimeMetrics::new();
        metrics.record_resolution("c1", "corr1", None, "acknowledged", 5);
        assert_eq!(metrics.snapshot().unknown.acknowledged, 1);
    }

    #[test]
    fn ring_is_bounded() {
        let metrics = RuntimeMetrics::new();
        for i in 0..(RESOLVED_RING_CAPACITY + 10) {
            metrics.record_resolution(&format!("c{i}"), "corr", Some(CommandType::Wake), "acknowledged", 1);
        }
        assert_eq!(metrics.snapshot().recent_resolved.len(), RESOLVED_RING_CAPACITY);
    }
}
