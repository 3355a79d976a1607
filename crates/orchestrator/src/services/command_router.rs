use crate::config::Config;
use crate::errors::RouteError;
use crate::persistence::CommandRepository;
use crate::state::host_aggregator::HostAggregator;
use crate::state::inflight::CommandOutcome;
use crate::state::node_registry::NodeRegistry;
use crate::services::webhook_dispatcher::WebhookDispatcher;
use crate::state::metrics::RuntimeMetrics;
use crate::state::stream_broker::StreamBroker;
use chrono::Utc;
use cnc_models::command::{correlation_id_or_default, Command, CommandState, CommandType};
use cnc_models::events::{WakeVerificationComplete, WakeVerificationStatus};
use cnc_models::fqn::Fqn;
use cnc_models::host::Host;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{instrument, warn};

/// Options shared by the wake operation (§4.2 operations table).
#[derive(Debug, Default)]
pub struct WakeOptions {
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub verify: bool,
    pub wol_port: Option<u16>,
}

/// Options for the two confirmation-gated operations, sleep and shutdown.
#[derive(Debug, Default)]
pub struct ConfirmedOptions {
    pub confirm_token: String,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
}

/// Maps an operator intent to a node-bound command: resolves the target,
/// enforces idempotency and per-host serialization, dispatches the frame,
/// and waits (bounded by `commandTimeout`) for the node's result (§4.2).
/// The only writer of `commands` and the only reader of `inflight` besides
/// the node session's result handler.
pub struct CommandRouter {
    config: Arc<Config>,
    nodes: Arc<NodeRegistry>,
    hosts: Arc<HostAggregator>,
    commands: Arc<CommandRepository>,
    inflight: Arc<crate::state::inflight::InflightTable>,
    metrics: Arc<RuntimeMetrics>,
    streams: Arc<StreamBroker>,
    webhooks: Arc<WebhookDispatcher>,
}

enum DispatchOutcome {
    Resolved(Value),
    Queued { command_id: String },
}

impl CommandRouter {
    pub fn new(
        config: Arc<Config>,
        nodes: Arc<NodeRegistry>,
        hosts: Arc<HostAggregator>,
        commands: Arc<CommandRepository>,
        inflight: Arc<crate::state::inflight::InflightTable>,
        metrics: Arc<RuntimeMetrics>,
        streams: Arc<StreamBroker>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        Self { config, nodes, hosts, commands, inflight, metrics, streams, webhooks }
    }

    #[instrument(skip(self, options))]
    pub async fn route_wake(self: &Arc<Self>, fqn: &str, options: WakeOptions) -> Result<Value, RouteError> {
        let host = self.resolve_host(fqn).await?;
        let correlation_id = correlation_id_or_default(options.correlation_id);
        let wol_port = options.wol_port.or_else(|| host.power_control.as_ref().and_then(|p| p.wol_port));
        let host_name = host.name.clone();
        let mac = host.primary_mac.clone();
        let verify = options.verify;

        let outcome = self
            .dispatch(
                &host.node_id,
                CommandType::Wake,
                &host.id,
                options.idempotency_key,
                correlation_id,
                move |command_id| {
                    let mut frame = json!({
                        "type": "wake",
                        "commandId": command_id,
                        "hostName": host_name,
                        "mac": mac,
                    });
                    if let Some(port) = wol_port {
                        frame["wolPort"] = json!(port);
                    }
                    if verify {
                        frame["verify"] = json!(true);
                    }
                    frame
                },
                false,
            )
            .await?;

        if verify {
            if let DispatchOutcome::Resolved(_) = outcome {
                let router = self.clone();
                let fqn = host.fqn();
                let node_id = host.node_id.clone();
                tokio::spawn(async move { router.run_wake_verification(fqn, node_id).await });
            }
        }

        Ok(self.finish_host_response(&host, outcome))
    }

    pub async fn route_sleep(&self, fqn: &str, options: ConfirmedOptions) -> Result<Value, RouteError> {
        self.route_confirmed(fqn, CommandType::SleepHost, "sleep-host", options).await
    }

    pub async fn route_shutdown(&self, fqn: &str, options: ConfirmedOptions) -> Result<Value, RouteError> {
        self.route_confirmed(fqn, CommandType::ShutdownHost, "shutdown-host", options).await
    }

    #[instrument(skip(self, options))]
    async fn route_confirmed(
        &self,
        fqn: &str,
        command_type: CommandType,
        frame_type: &'static str,
        options: ConfirmedOptions,
    ) -> Result<Value, RouteError> {
        if options.confirm_token.trim().is_empty() {
            return Err(RouteError::InvalidRequest("confirm token is required".into()));
        }
        let host = self.resolve_host(fqn).await?;
        let correlation_id = correlation_id_or_default(options.correlation_id);
        let fqn_owned = fqn.to_string();

        let outcome = self
            .dispatch(
                &host.node_id,
                command_type,
                &host.id,
                options.idempotency_key,
                correlation_id,
                move |command_id| json!({ "type": frame_type, "commandId": command_id, "fqn": fqn_owned }),
                false,
            )
            .await?;

        Ok(self.finish_host_response(&host, outcome))
    }

    #[instrument(skip(self, patch))]
    pub async fn route_update_host(
        &self,
        fqn: &str,
        patch: Value,
        idempotency_key: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<Value, RouteError> {
        let host = self.resolve_host(fqn).await?;
        let correlation_id = correlation_id_or_default(correlation_id);
        let fqn_owned = fqn.to_string();

        let outcome = self
            .dispatch(
                &host.node_id,
                CommandType::UpdateHost,
                &host.id,
                idempotency_key,
                correlation_id,
                move |command_id| json!({ "type": "update-host", "commandId": command_id, "fqn": fqn_owned, "patch": patch }),
                true,
            )
            .await?;

        Ok(self.finish_host_response(&host, outcome))
    }

    #[instrument(skip(self))]
    pub async fn route_delete_host(
        &self,
        fqn: &str,
        idempotency_key: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<Value, RouteError> {
        let host = self.resolve_host(fqn).await?;
        let correlation_id = correlation_id_or_default(correlation_id);
        let fqn_owned = fqn.to_string();

        let outcome = self
            .dispatch(
                &host.node_id,
                CommandType::DeleteHost,
                &host.id,
                idempotency_key,
                correlation_id,
                move |command_id| json!({ "type": "delete-host", "commandId": command_id, "fqn": fqn_owned }),
                true,
            )
            .await?;

        Ok(self.finish_host_response(&host, outcome))
    }

    #[instrument(skip(self))]
    pub async fn route_ping_host(&self, fqn: &str) -> Result<Value, RouteError> {
        let host = self.resolve_host(fqn).await?;
        let fqn_owned = fqn.to_string();

        let outcome = self
            .dispatch(
                &host.node_id,
                CommandType::PingHost,
                &host.id,
                None,
                correlation_id_or_default(None),
                move |command_id| json!({ "type": "ping-host", "commandId": command_id, "fqn": fqn_owned }),
                false,
            )
            .await?;

        match outcome {
            DispatchOutcome::Resolved(value) => Ok(value),
            DispatchOutcome::Queued { .. } => unreachable!("ping-host never queues while offline"),
        }
    }

    #[instrument(skip(self))]
    pub async fn route_scan_host_ports(&self, fqn: &str) -> Result<Value, RouteError> {
        let host = self.resolve_host(fqn).await?;

        let active = self
            .commands
            .find_non_terminal_of_type_for_target(&host.node_id, &host.id, CommandType::ScanHostPorts)
            .await
            .map_err(|e| RouteError::Internal(e.into()))?;
        if !active.is_empty() {
            return Err(RouteError::Conflict("a port scan is already in progress for this host".into()));
        }

        let fqn_owned = fqn.to_string();
        let outcome = self
            .dispatch(
                &host.node_id,
                CommandType::ScanHostPorts,
                &host.id,
                None,
                correlation_id_or_default(None),
                move |command_id| json!({ "type": "scan-host-ports", "commandId": command_id, "fqn": fqn_owned }),
                false,
            )
            .await?;

        match outcome {
            DispatchOutcome::Resolved(value) => Ok(value),
            DispatchOutcome::Queued { .. } => unreachable!("scan-host-ports never queues while offline"),
        }
    }

    /// Broadcasts a discovery scan to every connected node (§4.2: scan is
    /// not host-scoped, so there is no per-host serialization to enforce).
    #[instrument(skip(self))]
    pub async fn route_scan_hosts(&self, correlation_id: Option<String>) -> Result<Value, RouteError> {
        let correlation_id = correlation_id_or_default(correlation_id);
        let node_ids = self.nodes.connected_node_ids();
        if node_ids.is_empty() {
            return Err(RouteError::Offline("no nodes are connected".into()));
        }

        let mut dispatched = 0u32;
        for node_id in node_ids {
            let command = Command::new(CommandType::Scan, node_id.clone(), node_id.clone(), Value::Null, correlation_id.clone(), None);
            if self.commands.insert(&command).await.is_err() {
                continue;
            }
            self.metrics.record_dispatch(CommandType::Scan);

            let deadline = Instant::now() + self.config.command_timeout;
            let _receiver = self.inflight.register(command.command_id.clone(), node_id.clone(), correlation_id.clone(), deadline);

            let frame = json!({ "type": "scan", "commandId": command.command_id });
            match self.send_frame(&node_id, frame).await {
                Ok(()) => {
                    let _ = self.commands.mark_sent(&command.command_id, Utc::now()).await;
                    dispatched += 1;
                }
                Err(_) => {
                    self.inflight.resolve(&command.command_id, CommandOutcome::Failed("send-failed".into()));
                    let _ = self
                        .commands
                        .resolve(&command.command_id, CommandState::Failed, Utc::now(), None, Some("send-failed".into()))
                        .await;
                }
            }
        }

        if dispatched == 0 {
            return Err(RouteError::Offline("no nodes are connected".into()));
        }
        Ok(json!({ "dispatched": dispatched }))
    }

    /// Delivers a node's `command-result` frame to the waiting caller, if
    /// one is still waiting, and always persists the outcome (§4.2
    /// timeouts: "a late result is still recorded, never delivered twice").
    #[instrument(skip(self, payload))]
    pub async fn handle_command_result(&self, command_id: &str, success: bool, payload: Option<Value>, error: Option<String>) {
        let elapsed_ms = self.inflight.elapsed_ms(command_id).unwrap_or(0);
        let correlation_id = self.inflight.correlation_id(command_id).unwrap_or_default();

        let outcome = if success {
            CommandOutcome::Acknowledged(payload.clone().unwrap_or(Value::Null))
        } else {
            CommandOutcome::Failed(error.clone().unwrap_or_else(|| "rejected".into()))
        };
        self.inflight.resolve(command_id, outcome);

        let state = if success { CommandState::Acknowledged } else { CommandState::Failed };
        if let Err(err) = self.commands.resolve(command_id, state, Utc::now(), payload.clone(), error).await {
            warn!(command_id, %err, "failed to persist command result");
        }

        if let Ok(Some(command)) = self.commands.get(command_id).await {
            self.metrics.record_resolution(
                command_id,
                &correlation_id,
                Some(command.command_type),
                if success { "acknowledged" } else { "failed" },
                elapsed_ms,
            );

            if success && command.command_type == CommandType::ScanHostPorts {
                self.save_port_scan_result(&command.target, &payload).await;
            }
        }
    }

    /// A `scan-host-ports` ack carries the discovered ports in its payload;
    /// the aggregator is the only writer of that snapshot onto the host row
    /// (§4.3 Port-scan snapshot).
    async fn save_port_scan_result(&self, host_id: &str, payload: &Option<Value>) {
        let Some(payload) = payload else { return };
        let open_ports: Vec<cnc_models::host::OpenPort> = match payload.get("openPorts") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(ports) => ports,
                Err(err) => {
                    warn!(host_id, %err, "scan-host-ports payload has malformed openPorts");
                    return;
                }
            },
            None => return,
        };
        if let Err(err) = self.hosts.save_port_scan_snapshot(host_id, open_ports, Utc::now()).await {
            warn!(host_id, %err, "failed to persist port scan snapshot");
        }
    }

    async fn resolve_host(&self, fqn: &str) -> Result<Host, RouteError> {
        Fqn::parse(fqn).map_err(|e| RouteError::InvalidRequest(format!("invalid host name: {e}")))?;
        self.hosts
            .find_by_fqn(fqn)
            .await
            .map_err(RouteError::Internal)?
            .ok_or_else(|| RouteError::NotFound(format!("host '{fqn}' not found")))
    }

    fn finish_host_response(&self, host: &Host, outcome: DispatchOutcome) -> Value {
        match outcome {
            DispatchOutcome::Resolved(value) => {
                let mut body = json!({ "nodeId": host.node_id, "location": host.location });
                if let (Some(obj), Value::Object(extra)) = (body.as_object_mut(), value) {
                    obj.extend(extra);
                }
                body
            }
            DispatchOutcome::Queued { command_id } => {
                json!({ "nodeId": host.node_id, "location": host.location, "state": "queued", "commandId": command_id })
            }
        }
    }

    /// Dispatches a frame onto the node's outbound queue without blocking.
    /// §4.1: "overflow returns notConnected and closes with 1011/backpressure"
    /// — a full queue means the connection's consumer is stuck or too slow,
    /// so the caller gets the same offline-shaped error a missing
    /// connection would, and the socket itself is torn down with 1011
    /// rather than left to block the dispatching task indefinitely.
    async fn send_frame(&self, node_id: &str, frame: Value) -> Result<(), RouteError> {
        let connection = self.nodes.connection(node_id).ok_or_else(|| RouteError::Offline(node_id.to_string()))?;
        let encoded = serde_json::to_string(&frame).map_err(|e| RouteError::Internal(e.into()))?;
        match connection.sender.try_send(encoded) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RouteError::Offline(node_id.to_string())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(node_id, "outbound queue full, closing node channel with backpressure");
                let _ = connection.closer.try_send((1011, "backpressure"));
                Err(RouteError::Offline(node_id.to_string()))
            }
        }
    }

    /// Core per-command flow: idempotency dedup, per-host mutating
    /// serialization, dispatch, and bounded wait (§4.2). `allow_queue_when_offline`
    /// covers update-host/delete-host, which persist as `queued` instead of
    /// failing outright when the node is offline.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch<F>(
        &self,
        node_id: &str,
        command_type: CommandType,
        target: &str,
        idempotency_key: Option<String>,
        correlation_id: String,
        build_frame: F,
        allow_queue_when_offline: bool,
    ) -> Result<DispatchOutcome, RouteError>
    where
        F: FnOnce(&str) -> Value,
    {
        if command_type.is_mutating() {
            let active = self
                .commands
                .find_non_terminal_mutating_for_target(node_id, target)
                .await
                .map_err(|e| RouteError::Internal(e.into()))?;
            let conflicting = active.into_iter().find(|c| match (&c.idempotency_key, &idempotency_key) {
                (Some(existing), Some(requested)) => existing != requested,
                _ => true,
            });
            if let Some(existing) = conflicting {
                return Err(RouteError::Conflict(format!("command '{}' is already in progress for this host", existing.command_id)));
            }
        }

        if let Some(key) = &idempotency_key {
            if let Some(existing_id) = self.dedup_lookup_persisted(node_id, command_type, target, key).await {
                return self.attach_to_existing(&existing_id).await;
            }
        }

        let connected = self.nodes.is_connected(node_id);
        if !connected {
            if allow_queue_when_offline {
                let command = Command::new(command_type, node_id, target, Value::Null, correlation_id, idempotency_key);
                self.commands.insert(&command).await.map_err(|e| RouteError::Internal(e.into()))?;
                return Ok(DispatchOutcome::Queued { command_id: command.command_id });
            }
            return Err(RouteError::Offline(node_id.to_string()));
        }

        let command = Command::new(command_type, node_id, target, Value::Null, correlation_id.clone(), idempotency_key.clone());

        // Reserve the dedup slot before the command is persisted or sent: one
        // lock acquisition spanning check-and-insert means only one of two
        // concurrent same-key callers can win it. The loser attaches to the
        // winner's command instead of building and sending its own frame.
        if let Some(key) = &idempotency_key {
            if let Err(existing_id) = self.inflight.dedup_try_register(node_id, command_type, target, key, command.command_id.clone()) {
                return self.attach_to_existing(&existing_id).await;
            }
        }

        self.commands.insert(&command).await.map_err(|e| RouteError::Internal(e.into()))?;
        self.metrics.record_dispatch(command_type);

        let deadline = Instant::now() + self.config.command_timeout;
        let receiver = self.inflight.register(command.command_id.clone(), node_id.to_string(), correlation_id, deadline);

        let frame = build_frame(&command.command_id);
        if let Err(err) = self.send_frame(node_id, frame).await {
            self.inflight.resolve(&command.command_id, CommandOutcome::Failed(err.to_string()));
            let _ = self
                .commands
                .resolve(&command.command_id, CommandState::Failed, Utc::now(), None, Some(err.to_string()))
                .await;
            if let Some(key) = &idempotency_key {
                self.inflight.dedup_release(node_id, command_type, target, key);
            }
            return Err(err);
        }
        let _ = self.commands.mark_sent(&command.command_id, Utc::now()).await;

        let result = match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Ok(CommandOutcome::Failed("waiter dropped before resolution".into())),
            Err(_) => {
                let won_race = self.inflight.resolve(&command.command_id, CommandOutcome::TimedOut);
                if won_race {
                    let _ = self
                        .commands
                        .resolve(&command.command_id, CommandState::TimedOut, Utc::now(), None, Some("deadline exceeded".into()))
                        .await;
                    self.metrics.record_resolution(
                        &command.command_id,
                        &command.correlation_id,
                        Some(command_type),
                        "timed_out",
                        self.config.command_timeout.as_millis() as u64,
                    );
                }
                Err(RouteError::Timeout(command.command_id.clone()))
            }
        };

        if let Some(key) = &idempotency_key {
            self.inflight.dedup_release(node_id, command_type, target, key);
        }

        match result? {
            CommandOutcome::Acknowledged(value) => Ok(DispatchOutcome::Resolved(value)),
            CommandOutcome::Failed(reason) => Err(RouteError::Rejected(reason)),
            CommandOutcome::TimedOut => Err(RouteError::Timeout(command.command_id)),
        }
    }

    async fn dedup_lookup_persisted(&self, node_id: &str, command_type: CommandType, target: &str, key: &str) -> Option<String> {
        match self.commands.find_active_by_dedup_key(node_id, command_type, target, key).await {
            Ok(Some(command)) if !command.state.is_terminal() => Some(command.command_id),
            _ => None,
        }
    }

    /// A second caller hit the same idempotency key while the first is
    /// still in flight. The oneshot waiter already has an owner, so this
    /// caller instead polls the durable row until it reaches a terminal
    /// state, bounded by the same deadline the original dispatch is using.
    async fn attach_to_existing(&self, command_id: &str) -> Result<DispatchOutcome, RouteError> {
        let deadline = self.inflight.deadline(command_id).unwrap_or_else(|| Instant::now() + self.config.command_timeout);
        loop {
            if let Some(command) = self.commands.get(command_id).await.map_err(|e| RouteError::Internal(e.into()))? {
                match command.state {
                    CommandState::Acknowledged => return Ok(DispatchOutcome::Resolved(command.outcome.unwrap_or(Value::Null))),
                    CommandState::Failed => return Err(RouteError::Rejected(command.error.unwrap_or_default())),
                    CommandState::TimedOut => return Err(RouteError::Timeout(command.command_id)),
                    CommandState::Queued | CommandState::Sent => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(RouteError::Timeout(command_id.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Polls host status and liveness after a verified wake request until
    /// the host reports awake, the verification window elapses, or the
    /// node disconnects (§4.2 wake verification).
    async fn run_wake_verification(self: Arc<Self>, fqn: String, node_id: String) {
        let deadline = Instant::now() + self.config.wake_verification_window;
        let mut attempts = 0u32;
        let started = Instant::now();

        let status = loop {
            attempts += 1;
            if !self.nodes.is_connected(&node_id) {
                break WakeVerificationStatus::Unreachable;
            }
            match self.hosts.find_by_fqn(&fqn).await {
                Ok(Some(host)) if host.status == cnc_models::host::HostStatus::Awake => {
                    break WakeVerificationStatus::Verified;
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                break WakeVerificationStatus::Timeout;
            }
            tokio::time::sleep(self.config.wake_verification_poll_interval).await;
        };

        let event = WakeVerificationComplete {
            command_id: format!("wake-verify_{}", uuid::Uuid::new_v4()),
            fqn,
            status,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            source: "wake-verification".into(),
        };
        let stream_event = cnc_models::events::StreamEvent::from_wake_verification(&event);
        self.streams.broadcast(stream_event.clone());
        self.webhooks.notify_wake_verified(&stream_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::client::DbClient;
    use crate::persistence::{HistoryRepository, HostRepository, WebhookRepository};
    use crate::state::node_registry::NodeConnection;
    use cnc_models::host::{Host, HostStatus};
    use std::collections::BTreeSet;

    fn sample_config() -> Config {
        Config {
            database_url: ":memory:".into(),
            database_auth_token: None,
            port: 3000,
            trust_proxy: false,
            cors_origins: crate::config::CorsOrigins::Any,
            command_timeout: Duration::from_millis(500),
            wake_verification_window: Duration::from_secs(120),
            wake_verification_poll_interval: Duration::from_secs(5),
            command_retention_days: 30,
            host_status_history_retention_days: 90,
            pruning_interval: Duration::from_secs(3600),
            schedule_worker_enabled: true,
            schedule_poll_interval: Duration::from_secs(60),
            schedule_batch_size: 50,
            ws_max_connections_per_ip: 8,
            ws_message_rate_limit_per_second: 100,
            ws_require_tls: false,
            ws_allow_query_token_auth: true,
            min_supported_protocol_version: 1,
            max_supported_protocol_version: 1,
            session_token_issuer: "cnc-core".into(),
            session_token_audience: "node-agent".into(),
            session_token_ttl: Duration::from_secs(3600),
            session_token_secrets: vec!["test-secret".into()],
            node_auth_tokens: vec!["static-token-abc".into()],
            port_scan_cache_ttl: Duration::from_secs(4 * 3600),
            webhook_max_attempts: 5,
            webhook_backoff_base: Duration::from_millis(500),
            mac_vendor_cache_ttl: Duration::from_secs(86400),
            mac_vendor_cache_capacity: 1000,
        }
    }

    struct Harness {
        router: Arc<CommandRouter>,
        nodes: Arc<NodeRegistry>,
        metrics: Arc<RuntimeMetrics>,
        host: Host,
        outbound_rx: mpsc::Receiver<String>,
    }

    async fn harness() -> Harness {
        let db = DbClient::connect(":memory:", None).await.unwrap();
        let hosts = Arc::new(HostAggregator::new(HostRepository::new(db.clone()), HistoryRepository::new(db.clone()), Duration::from_secs(3600)));
        let nodes = Arc::new(NodeRegistry::new());
        let commands = Arc::new(CommandRepository::new(db.clone()));
        let inflight = Arc::new(crate::state::inflight::InflightTable::new());
        let metrics = Arc::new(RuntimeMetrics::new());
        let streams = Arc::new(StreamBroker::new());
        let config = Arc::new(sample_config());
        let webhooks_repo = Arc::new(WebhookRepository::new(db));
        let webhook_dispatcher = Arc::new(WebhookDispatcher::new(config.clone(), webhooks_repo));

        let host = hosts.reconcile_host("node-1", sample_host("desktop", "aa:bb:cc:dd:ee:ff")).await.unwrap();

        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(4);
        let (closer_tx, _closer_rx) = mpsc::channel::<(u16, &'static str)>(1);
        nodes.register(
            "node-1",
            NodeConnection { node_id: "node-1".into(), sender: outbound_tx, closer: closer_tx },
            1,
            Value::Null,
        );

        let router = Arc::new(CommandRouter::new(
            config,
            nodes.clone(),
            hosts,
            commands,
            inflight,
            metrics.clone(),
            streams,
            webhook_dispatcher,
        ));

        Harness { router, nodes, metrics, host, outbound_rx }
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
            power_control: None,
            port_scan: None,
        }
    }

    #[tokio::test]
    async fn route_wake_sends_exactly_one_frame_and_times_out_without_a_result() {
        let mut h = harness().await;
        let fqn = h.host.fqn();

        let result = h.router.route_wake(&fqn, WakeOptions::default()).await;
        assert!(matches!(result, Err(RouteError::Timeout(_))));

        let frame = h.outbound_rx.try_recv().expect("exactly one wake frame should be sent");
        assert!(frame.contains("\"type\":\"wake\""));
        assert!(h.outbound_rx.try_recv().is_err(), "no second frame should follow");
    }

    /// Regression test for the dedup race (§4.2 Idempotency, testable
    /// property #3): two concurrent wake requests sharing an idempotency key
    /// against the same connected node must produce exactly one outbound
    /// frame, with the second request attaching to the first's command
    /// instead of dispatching its own (scenario S1).
    #[tokio::test]
    async fn concurrent_dispatch_with_shared_idempotency_key_sends_one_frame() {
        let mut h = harness().await;
        let fqn = h.host.fqn();

        let router_a = h.router.clone();
        let router_b = h.router.clone();
        let fqn_a = fqn.clone();
        let fqn_b = fqn.clone();

        let opts_a = WakeOptions { idempotency_key: Some("shared-key".into()), ..Default::default() };
        let opts_b = WakeOptions { idempotency_key: Some("shared-key".into()), ..Default::default() };

        let (result_a, result_b) =
            tokio::join!(router_a.route_wake(&fqn_a, opts_a), router_b.route_wake(&fqn_b, opts_b));

        assert!(matches!(result_a, Err(RouteError::Timeout(_))));
        assert!(matches!(result_b, Err(RouteError::Timeout(_))));

        let first = h.outbound_rx.try_recv().expect("exactly one wake frame should be sent");
        assert!(first.contains("\"type\":\"wake\""));
        assert!(h.outbound_rx.try_recv().is_err(), "the racing caller must not send its own frame");
    }

    #[tokio::test]
    async fn wake_timeout_is_recorded_in_metrics() {
        let h = harness().await;
        let fqn = h.host.fqn();

        let result = h.router.route_wake(&fqn, WakeOptions::default()).await;
        assert!(matches!(result, Err(RouteError::Timeout(_))));

        let snapshot = h.metrics.snapshot();
        let wake_counters = &snapshot.commands["wake"];
        assert_eq!(wake_counters.timed_out, 1);
        assert_eq!(wake_counters.dispatched, 1);
    }

    #[tokio::test]
    async fn scan_broadcast_with_no_connected_nodes_is_offline_and_creates_no_commands() {
        let db = DbClient::connect(":memory:", None).await.unwrap();
        let hosts = Arc::new(HostAggregator::new(HostRepository::new(db.clone()), HistoryRepository::new(db.clone()), Duration::from_secs(3600)));
        let nodes = Arc::new(NodeRegistry::new());
        let commands = Arc::new(CommandRepository::new(db.clone()));
        let inflight = Arc::new(crate::state::inflight::InflightTable::new());
        let metrics = Arc::new(RuntimeMetrics::new());
        let streams = Arc::new(StreamBroker::new());
        let config = Arc::new(sample_config());
        let webhooks_repo = Arc::new(WebhookRepository::new(db));
        let webhook_dispatcher = Arc::new(WebhookDispatcher::new(config.clone(), webhooks_repo));
        let router = Arc::new(CommandRouter::new(config, nodes, hosts, commands.clone(), inflight, metrics, streams, webhook_dispatcher));

        let result = router.route_scan_hosts(None).await;
        assert!(matches!(result, Err(RouteError::Offline(_))));
        // No nodes were ever connected, so the broadcast loop never ran;
        // confirm no stray command row was created for any node id.
        assert!(commands.find_active_by_dedup_key("node-1", CommandType::Scan, "node-1", "none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_host_on_an_unknown_fqn_returns_not_found() {
        let h = harness().await;
        let unknown_fqn = cnc_models::fqn::Fqn::build("ghost", "lab", Some("node-1"));
        let result = h.router.resolve_host(&unknown_fqn).await;
        assert!(matches!(result, Err(RouteError::NotFound(_))));
    }

    #[tokio::test]
    async fn route_ping_host_to_a_disconnected_node_returns_offline() {
        let h = harness().await;
        assert!(!h.nodes.mark_offline_if_current("node-1", &mpsc::channel::<String>(1).0));
        // The registered connection is still current; evict it directly by
        // observing its own sender.
        let connection = h.nodes.connection("node-1").unwrap();
        h.nodes.mark_offline_if_current("node-1", &connection.sender);

        let fqn = h.host.fqn();
        let result = h.router.route_ping_host(&fqn).await;
        assert!(matches!(result, Err(RouteError::Offline(_))));
    }
}
