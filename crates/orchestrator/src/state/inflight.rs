use cnc_models::command::CommandType;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome delivered to a waiter (§9 waiter primitive: "either a result
/// value or an error classification").
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Acknowledged(serde_json::Value),
    Failed(String),
    TimedOut,
}

struct InflightEntry {
    node_id: String,
    correlation_id: String,
    started_at: Instant,
    deadline: Instant,
    waiter: Option<oneshot::Sender<CommandOutcome>>,
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct DedupKey {
    node_id: String,
    command_type: CommandType,
    target: String,
    idempotency_key: String,
}

/// Single exclusive owner of both the inflight table and the idempotency
/// dedup map (§3 Ownership, §4.2 Inflight table / Idempotency). Every
/// access goes through the command router.
pub struct InflightTable {
    entries: Mutex<HashMap<String, InflightEntry>>,
    dedup: Mutex<HashMap<DedupKey, String>>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), dedup: Mutex::new(HashMap::new()) }
    }

    pub fn register(
        &self,
        command_id: String,
        node_id: String,
        correlation_id: String,
        deadline: Instant,
    ) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().unwrap().insert(
            command_id,
            InflightEntry { node_id, correlation_id, started_at: Instant::now(), deadline, waiter: Some(tx) },
        );
        rx
    }

    /// Resolves the waiter for `command_id`, if one is still pending. A
    /// late result after timeout finds no waiter and returns `false` — the
    /// caller should still update the durable log but must not attempt to
    /// resolve twice.
    pub fn resolve(&self, command_id: &str, outcome: CommandOutcome) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.remove(command_id) {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(outcome);
                return true;
            }
        }
        false
    }

    pub fn deadline(&self, command_id: &str) -> Option<Instant> {
        self.entries.lock().unwrap().get(command_id).map(|e| e.deadline)
    }

    pub fn correlation_id(&self, command_id: &str) -> Option<String> {
        self.entries.lock().unwrap().get(command_id).map(|e| e.correlation_id.clone())
    }

    /// Fails every inflight entry targeting `node_id` (§4.1 close,
    /// §4.2 node-loss).
    pub fn fail_all_for_node(&self, node_id: &str) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        let mut resolved = Vec::new();
        entries.retain(|command_id, entry| {
            if entry.node_id == node_id {
                if let Some(waiter) = entry.waiter.take() {
                    let _ = waiter.send(CommandOutcome::Failed("node-disconnected".into()));
                }
                resolved.push(command_id.clone());
                false
            } else {
                true
            }
        });
        resolved
    }

    /// Fails every remaining inflight entry with `shutdown` (graceful
    /// shutdown, §5 Cancellation).
    pub fn fail_all(&self) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        let ids: Vec<String> = entries.keys().cloned().collect();
        for (_, entry) in entries.iter_mut() {
            if let Some(waiter) = entry.waiter.take() {
                let _ = waiter.send(CommandOutcome::Failed("shutdown".into()));
            }
        }
        entries.clear();
        ids
    }

    pub fn elapsed_ms(&self, command_id: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(command_id).map(|e| e.started_at.elapsed().as_millis() as u64)
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Atomic check-and-register: one lock acquisition spans both the
    /// lookup and the insert, so two callers racing on the same key can
    /// never both win the reservation (§4.2 Idempotency, testable
    /// property #3). The loser gets the winner's `command_id` back and
    /// should attach to it instead of dispatching its own frame.
    pub fn dedup_try_register(
        &self,
        node_id: &str,
        command_type: CommandType,
        target: &str,
        idempotency_key: &str,
        command_id: String,
    ) -> Result<(), String> {
        let key = DedupKey { node_id: node_id.to_string(), command_type, target: target.to_string(), idempotency_key: idempotency_key.to_string() };
        let mut dedup = self.dedup.lock().unwrap();
        if let Some(existing) = dedup.get(&key) {
            return Err(existing.clone());
        }
        dedup.insert(key, command_id);
        Ok(())
    }

    /// Reclaims a terminal entry's dedup mapping so memory is bounded by
    /// live + recently-terminal keys, not all-time history (§9).
    pub fn dedup_release(&self, node_id: &str, command_type: CommandType, target: &str, idempotency_key: &str) {
        let key = DedupKey { node_id: node_id.to_string(), command_type, target: target.to_string(), idempotency_key: idempotency_key.to_string() };
        self.dedup.lock().unwrap().remove(&key);
    }
}

impl Default for InflightTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Duration;

    #[test]
    fn register_and_resolve_delivers_outcome() {
        let table = InflightTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut rx = table.register("cmd-1".into(), "node-1".into(), "corr-1".into(), deadline);

        assert!(table.resolve("cmd-1", CommandOutcome::Acknowledged(serde_json::json!({"ok": true}))));
        let outcome = rx.try_recv().unwrap();
        assert!(matches!(outcome, CommandOutcome::Acknowledged(_)));
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn resolve_twice_only_succeeds_once() {
        let table = InflightTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let _rx = table.register("cmd-1".into(), "node-1".into(), "corr-1".into(), deadline);

        assert!(table.resolve("cmd-1", CommandOutcome::TimedOut));
        assert!(!table.resolve("cmd-1", CommandOutcome::TimedOut));
    }

    #[test]
    fn fail_all_for_node_only_touches_that_node() {
        let table = InflightTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut rx_a = table.register("cmd-a".into(), "node-1".into(), "corr-a".into(), deadline);
        let mut rx_b = table.register("cmd-b".into(), "node-2".into(), "corr-b".into(), deadline);

        let failed = table.fail_all_for_node("node-1");
        assert_eq!(failed, vec!["cmd-a".to_string()]);
        assert!(matches!(rx_a.try_recv().unwrap(), CommandOutcome::Failed(_)));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn fail_all_clears_every_entry() {
        let table = InflightTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut rx = table.register("cmd-1".into(), "node-1".into(), "corr-1".into(), deadline);

        let failed = table.fail_all();
        assert_eq!(failed, vec!["cmd-1".to_string()]);
        assert!(matches!(rx.try_recv().unwrap(), CommandOutcome::Failed(_)));
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn dedup_try_register_wins_once_then_returns_existing_id() {
        let table = InflightTable::new();
        assert!(table.dedup_try_register("node-1", CommandType::Wake, "host-1", "key-1", "cmd-1".into()).is_ok());

        let second = table.dedup_try_register("node-1", CommandType::Wake, "host-1", "key-1", "cmd-2".into());
        assert_eq!(second, Err("cmd-1".to_string()));
    }

    #[test]
    fn dedup_release_frees_the_key_for_reuse() {
        let table = InflightTable::new();
        table.dedup_try_register("node-1", CommandType::Wake, "host-1", "key-1", "cmd-1".into()).unwrap();
        table.dedup_release("node-1", CommandType::Wake, "host-1", "key-1");

        assert!(table.dedup_try_register("node-1", CommandType::Wake, "host-1", "key-1", "cmd-2".into()).is_ok());
    }

    /// Regression test for the dedup race: two concurrent callers racing on
    /// the same `(nodeId, type, target, idempotencyKey)` must not both win
    /// the reservation. Exactly one should dispatch; the other attaches to
    /// the winner's command id (§4.2 Idempotency, testable property #3).
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dedup_registration_has_exactly_one_winner() {
        let table = Arc::new(InflightTable::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let command_id = format!("cmd-{i}");
                let result = table.dedup_try_register("node-1", CommandType::Wake, "host-1", "shared-key", command_id.clone());
                (command_id, result)
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let winners: Vec<&String> = results.iter().filter(|(_, r)| r.is_ok()).map(|(id, _)| id).collect();
        assert_eq!(winners.len(), 1, "exactly one concurrent caller should win the dedup reservation");

        let winner_id = winners[0];
        let losers_agree = results.iter().filter_map(|(_, r)| r.as_ref().err()).all(|existing_id| existing_id == winner_id);
        assert!(losers_agree, "every loser must attach to the same winning command id");
    }
}
