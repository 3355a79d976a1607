use crate::state::host_aggregator::AggregatorEventSubscriber;
use cnc_models::events::{AggregatorEvent, StreamEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default, Serialize)]
pub struct EventStats {
    pub total_broadcasts: u64,
    pub by_type: HashMap<String, u64>,
    pub deliveries: u64,
    pub dropped_no_subscribers: u64,
    pub send_failures: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct BrokerStats {
    pub active_clients: u64,
    pub total_connections: u64,
    pub total_disconnects: u64,
    pub total_errors: u64,
    pub close_codes: HashMap<u16, u64>,
    pub close_reasons: HashMap<String, u64>,
    pub events: EventStats,
}

/// Fan-out of mutating aggregator/wake-verification events to operator
/// subscribers (§4.4). `tokio::sync::broadcast` gives every subscriber its
/// own ordered queue, matching the per-subscriber ordering guarantee in
/// §5.
pub struct StreamBroker {
    sender: broadcast::Sender<StreamEvent>,
    active_clients: AtomicU64,
    total_connections: AtomicU64,
    total_disconnects: AtomicU64,
    total_errors: AtomicU64,
    close_codes: RwLock<HashMap<u16, u64>>,
    close_reasons: RwLock<HashMap<String, u64>>,
    total_broadcasts: AtomicU64,
    by_type: RwLock<HashMap<String, u64>>,
    deliveries: AtomicU64,
    dropped_no_subscribers: AtomicU64,
    send_failures: AtomicU64,
}

impl StreamBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            active_clients: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            total_disconnects: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            close_codes: RwLock::new(HashMap::new()),
            close_reasons: RwLock::new(HashMap::new()),
            total_broadcasts: AtomicU64::new(0),
            by_type: RwLock::new(HashMap::new()),
            deliveries: AtomicU64::new(0),
            dropped_no_subscribers: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.sender.subscribe()
    }

    pub fn record_disconnect(&self, close_code: u16, close_reason: &str) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
        self.total_disconnects.fetch_add(1, Ordering::Relaxed);
        *self.close_codes.write().unwrap().entry(close_code).or_insert(0) += 1;
        *self.close_reasons.write().unwrap().entry(close_reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Broadcasts a mutating event to every `OPEN` subscriber (§8 property
    /// 5). A closed channel (no receivers) increments
    /// `dropped_no_subscribers` rather than failing.
    #[instrument(skip(self, event))]
    pub fn broadcast(&self, event: StreamEvent) {
        self.total_broadcasts.fetch_add(1, Ordering::Relaxed);
        *self.by_type.write().unwrap().entry(event.event_type.clone()).or_insert(0) += 1;

        match self.sender.send(event) {
            Ok(subscriber_count) => {
                debug!(subscriber_count, "broadcast delivered");
                self.deliveries.fetch_add(subscriber_count as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_no_subscribers.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            active_clients: self.active_clients.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_disconnects: self.total_disconnects.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            close_codes: self.close_codes.read().unwrap().clone(),
            close_reasons: self.close_reasons.read().unwrap().clone(),
            events: EventStats {
                total_broadcasts: self.total_broadcasts.load(Ordering::Relaxed),
                by_type: self.by_type.read().unwrap().clone(),
                deliveries: self.deliveries.load(Ordering::Relaxed),
                dropped_no_subscribers: self.dropped_no_subscribers.load(Ordering::Relaxed),
                send_failures: self.send_failures.load(Ordering::Relaxed),
            },
        }
    }

    /// Graceful shutdown: the broadcast channel itself is dropped with the
    /// broker; subscriber tasks observe `RecvError::Closed` and close their
    /// sockets with `1000/"Server shutdown"` (§4.4 Shutdown).
    pub fn active_client_count(&self) -> u64 {
        self.active_clients.load(Ordering::Relaxed)
    }
}

impl Default for StreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatorEventSubscriber for StreamBroker {
    fn on_event(&self, event: &AggregatorEvent) {
        self.broadcast(StreamEvent::from_aggregator_event(event));
    }
}
