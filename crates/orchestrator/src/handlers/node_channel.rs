use crate::auth;
use crate::errors::RouteError;
use crate::state::{AppState, NodeConnection};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use cnc_models::host::{Host, HostStatus, PowerControlMetadata};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

const OUTBOUND_BUFFER_CAPACITY: usize = 64;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_FRAME_BYTES: usize = 256 * 1024;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY_VIOLATION: u16 = 4401;
const CLOSE_POLICY_REPLACED: u16 = 4409;

/// First frame a node must send, and every frame type it may send
/// afterward (§6 Node control channel, inbound).
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InboundFrame {
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(default)]
        metadata: Value,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat {},
    #[serde(rename = "host-discovered")]
    HostDiscovered {
        #[serde(rename = "nodeId")]
        node_id: String,
        host: WireHost,
        location: String,
    },
    #[serde(rename = "host-updated")]
    HostUpdated {
        #[serde(rename = "nodeId")]
        node_id: String,
        host: WireHost,
        location: String,
    },
    #[serde(rename = "host-removed")]
    HostRemoved {
        #[serde(rename = "nodeId")]
        node_id: String,
        name: String,
    },
    #[serde(rename = "command-result")]
    CommandResult {
        #[serde(rename = "commandId")]
        command_id: String,
        success: bool,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "ping-result")]
    PingResult {
        #[serde(rename = "commandId")]
        command_id: String,
        #[serde(rename = "latencyMs", default)]
        latency_ms: Option<u64>,
        success: bool,
        status: String,
        source: String,
    },
    #[serde(rename = "host-port-scan-result")]
    HostPortScanResult {
        #[serde(rename = "commandId")]
        command_id: String,
        #[serde(rename = "hostPortScan")]
        host_port_scan: Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHost {
    name: String,
    primary_mac: String,
    #[serde(default)]
    secondary_macs: BTreeSet<String>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    status: Option<HostStatus>,
    #[serde(default)]
    discovered: Option<bool>,
    #[serde(default)]
    ping_responsive: Option<bool>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    power_control: Option<WirePowerControl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePowerControl {
    #[serde(default)]
    wol_port: Option<u16>,
    #[serde(default)]
    supports_sleep: bool,
    #[serde(default)]
    supports_shutdown: bool,
}

impl WireHost {
    fn into_host(self, location: String) -> Host {
        Host {
            id: String::new(),
            node_id: String::new(),
            name: self.name,
            location,
            primary_mac: self.primary_mac,
            secondary_macs: self.secondary_macs,
            ip: self.ip,
            status: self.status.unwrap_or(HostStatus::Asleep),
            last_seen_at: Utc::now(),
            discovered: self.discovered.unwrap_or(true),
            ping_responsive: self.ping_responsive,
            notes: self.notes,
            tags: self.tags,
            power_control: self.power_control.map(|p| PowerControlMetadata {
                wol_port: p.wol_port,
                supports_sleep: p.supports_sleep,
                supports_shutdown: p.supports_shutdown,
            }),
            port_scan: None,
        }
    }
}

/// Upgrade gate for the node control channel (§4.1): TLS policy, per-IP
/// connection cap, then token extraction and authentication. Registration
/// itself happens after the upgrade, on the first frame.
#[instrument(skip(websocket, state, headers))]
pub async fn upgrade(
    websocket: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if state.config.ws_require_tls {
        let forwarded_https = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()).map(|v| v.eq_ignore_ascii_case("https")).unwrap_or(false);
        if !forwarded_https {
            return RouteError::Forbidden("TLS is required for the node channel".into()).into_response();
        }
    }

    let ip = remote_addr.ip();
    if state.nodes.node_channel_count_for_ip(ip) >= state.config.ws_max_connections_per_ip {
        return RouteError::RateLimited.into_response();
    }

    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let protocol = headers.get(SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok());
    let token = match auth::extract_token(authorization, protocol, query.as_deref(), state.config.ws_allow_query_token_auth) {
        Some(token) => token,
        None => return RouteError::Unauthorized.into_response(),
    };
    if auth::authenticate_node_channel(&state.config, &token).is_none() {
        return RouteError::Unauthorized.into_response();
    }

    state.nodes.increment_node_channel(ip);
    websocket.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

/// Drives one node's channel for its entire lifetime: registration, then a
/// writer task and a reading loop running concurrently, torn down together
/// on either side's exit (§4.1 steady state, §9 Triple task pattern).
async fn handle_socket(socket: WebSocket, state: AppState, ip: IpAddr) {
    let (mut sink, mut stream) = socket.split();

    let (node_id, protocol_version, metadata) = match await_registration(&mut stream, &mut sink, &state.config).await {
        Some(registration) => registration,
        None => {
            state.nodes.decrement_node_channel(ip);
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER_CAPACITY);
    let (closer_tx, mut closer_rx) = mpsc::channel::<(u16, &'static str)>(1);
    let connection = NodeConnection { node_id: node_id.clone(), sender: outbound_tx, closer: closer_tx };
    let observed_sender = connection.sender.clone();

    if let Some(previous) = state.nodes.register(&node_id, connection, protocol_version, metadata) {
        drop(previous);
    }
    info!(node_id, %ip, "node channel registered");

    let mut shutdown = state.shutdown.clone();
    let mut writer_task = tokio::spawn(async move {
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        let close = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    break close_message(CLOSE_GOING_AWAY, "server-shutdown");
                }
                forced = closer_rx.recv() => {
                    // `None` means the connection was evicted and `closer_tx`
                    // dropped alongside it; the outbound channel's own
                    // `None` branch produces the right close for that case.
                    if let Some((code, reason)) = forced {
                        break close_message(code, reason);
                    }
                }
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break close_message(CLOSE_NORMAL, "server-shutdown");
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if sink.send(Message::Text(frame)).await.is_err() {
                                break close_message(CLOSE_NORMAL, "server-shutdown");
                            }
                        }
                        // The registry evicted this sender for a reconnecting node.
                        None => break close_message(CLOSE_POLICY_REPLACED, "policy-replaced"),
                    }
                }
            }
        };
        let _ = sink.send(close).await;
    });

    let reader_state = state.clone();
    let reader_node_id = node_id.clone();
    let mut reader_task = tokio::spawn(async move {
        run_reader(&mut stream, &reader_state, &reader_node_id).await;
    });

    tokio::select! {
        _ = &mut writer_task => { reader_task.abort(); }
        _ = &mut reader_task => { writer_task.abort(); }
    }

    if state.nodes.mark_offline_if_current(&node_id, &observed_sender) {
        if let Err(err) = state.hosts.mark_node_hosts_unreachable(&node_id).await {
            warn!(node_id, %err, "failed to mark node's hosts unreachable after disconnect");
        }
        state.inflight.fail_all_for_node(&node_id);
    }
    state.nodes.decrement_node_channel(ip);
    info!(node_id, %ip, "node channel closed");
}

/// Waits for the mandatory first `register` frame (§4.1 registration
/// protocol). Anything else, or silence past the heartbeat timeout,
/// closes the socket without registering. An out-of-range protocol
/// version is rejected with a structured error frame before the close,
/// per §4.1: "Rejects unsupported protocol versions with a close code
/// and structured error frame."
async fn await_registration(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    config: &crate::config::Config,
) -> Option<(String, u32, Value)> {
    let first = tokio::time::timeout(HEARTBEAT_TIMEOUT, stream.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            let _ = sink.send(close_message(CLOSE_POLICY_VIOLATION, "policy-violation")).await;
            return None;
        }
    };
    if text.len() > MAX_FRAME_BYTES {
        let _ = sink.send(close_message(CLOSE_POLICY_VIOLATION, "policy-violation")).await;
        return None;
    }

    match serde_json::from_str::<InboundFrame>(&text) {
        Ok(InboundFrame::Register { node_id, protocol_version, metadata }) => {
            if !protocol_version_supported(protocol_version, config) {
                warn!(node_id, protocol_version, "node registered with an unsupported protocol version");
                let error_frame = serde_json::json!({
                    "type": "error",
                    "error": "unsupported-protocol-version",
                    "minSupportedProtocolVersion": config.min_supported_protocol_version,
                    "maxSupportedProtocolVersion": config.max_supported_protocol_version,
                });
                let _ = sink.send(Message::Text(error_frame.to_string())).await;
                let _ = sink.send(close_message(CLOSE_POLICY_VIOLATION, "unsupported-protocol-version")).await;
                return None;
            }
            debug!(node_id, protocol_version, "node sent registration frame");
            Some((node_id, protocol_version, metadata))
        }
        _ => {
            let _ = sink.send(close_message(CLOSE_POLICY_VIOLATION, "policy-violation")).await;
            None
        }
    }
}

/// Steady-state read loop: per-connection inbound rate limiting, an
/// inactivity-bounded heartbeat timeout, and dispatch of every remaining
/// frame type to its owning component (§4.1, §6).
async fn run_reader(stream: &mut futures::stream::SplitStream<WebSocket>, state: &AppState, node_id: &str) {
    let mut window_started_at = Instant::now();
    let mut messages_in_window = 0u32;

    loop {
        let next = tokio::time::timeout(HEARTBEAT_TIMEOUT, stream.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                warn!(node_id, %err, "node channel read error");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!(node_id, "node channel heartbeat timeout");
                return;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };

        if Instant::now().duration_since(window_started_at) >= Duration::from_secs(1) {
            window_started_at = Instant::now();
            messages_in_window = 0;
        }
        messages_in_window += 1;
        if messages_in_window > state.config.ws_message_rate_limit_per_second {
            warn!(node_id, "node channel exceeded inbound message rate limit");
            return;
        }

        if text.len() > MAX_FRAME_BYTES {
            state.nodes.increment_invalid_payload_count(node_id);
            continue;
        }

        dispatch_frame(state, node_id, &text).await;
    }
}

async fn dispatch_frame(state: &AppState, node_id: &str, text: &str) {
    let frame = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            state.nodes.increment_invalid_payload_count(node_id);
            warn!(node_id, %err, "node sent an unparseable frame");
            return;
        }
    };

    match frame {
        InboundFrame::Register { .. } => {
            warn!(node_id, "node re-sent register after the handshake; ignoring");
        }
        InboundFrame::Heartbeat {} => {
            state.nodes.record_heartbeat(node_id);
        }
        InboundFrame::HostDiscovered { node_id: frame_node_id, host, location } => {
            if let Err(err) = state.hosts.reconcile_host(&frame_node_id, host.into_host(location)).await {
                warn!(node_id, %err, "failed to reconcile discovered host");
            }
        }
        InboundFrame::HostUpdated { node_id: frame_node_id, host, location } => {
            if let Err(err) = state.hosts.reconcile_host(&frame_node_id, host.into_host(location)).await {
                warn!(node_id, %err, "failed to reconcile updated host");
            }
        }
        InboundFrame::HostRemoved { node_id: frame_node_id, name } => {
            if let Err(err) = state.hosts.remove_host(&frame_node_id, &name).await {
                warn!(node_id, %err, "failed to remove host");
            }
        }
        InboundFrame::CommandResult { command_id, success, payload, error } => {
            state.router.handle_command_result(&command_id, success, payload, error).await;
        }
        InboundFrame::PingResult { command_id, latency_ms, success, status, source } => {
            let payload = serde_json::json!({ "latencyMs": latency_ms, "status": status, "source": source });
            state.router.handle_command_result(&command_id, success, Some(payload), None).await;
        }
        InboundFrame::HostPortScanResult { command_id, host_port_scan } => {
            state.router.handle_command_result(&command_id, true, Some(host_port_scan), None).await;
        }
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

fn protocol_version_supported(version: u32, config: &crate::config::Config) -> bool {
    version >= config.min_supported_protocol_version && version <= config.max_supported_protocol_version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_parses_camel_case_fields() {
        let raw = r#"{"type":"register","nodeId":"node-1","protocolVersion":1,"metadata":{"os":"linux"}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::Register { node_id, protocol_version, .. } => {
                assert_eq!(node_id, "node-1");
                assert_eq!(protocol_version, 1);
            }
            _ => panic!("expected register frame"),
        }
    }

    #[test]
    fn host_port_scan_result_carries_snapshot_payload() {
        let raw = r#"{"type":"host-port-scan-result","commandId":"c1","hostPortScan":{"hostName":"desktop","mac":"aa:bb","ip":"10.0.0.1","scannedAt":"2026-01-01T00:00:00Z","openPorts":[]}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, InboundFrame::HostPortScanResult { command_id, .. } if command_id == "c1"));
    }

    #[test]
    fn wire_host_defaults_unset_optional_fields() {
        let raw = r#"{"name":"desktop","primaryMac":"AA:BB:CC:DD:EE:FF"}"#;
        let wire: WireHost = serde_json::from_str(raw).unwrap();
        let host = wire.into_host("lab".into());
        assert_eq!(host.location, "lab");
        assert!(host.discovered);
        assert_eq!(host.status, HostStatus::Asleep);
    }

    fn sample_config() -> crate::config::Config {
        crate::config::Config {
            database_url: ":memory:".into(),
            database_auth_token: None,
            port: 3000,
            trust_proxy: false,
            cors_origins: crate::config::CorsOrigins::Any,
            command_timeout: Duration::from_secs(30),
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
            max_supported_protocol_version: 2,
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

    #[test]
    fn protocol_version_within_range_is_supported() {
        let config = sample_config();
        assert!(protocol_version_supported(1, &config));
        assert!(protocol_version_supported(2, &config));
    }

    #[test]
    fn protocol_version_outside_range_is_rejected() {
        let config = sample_config();
        assert!(!protocol_version_supported(0, &config));
        assert!(!protocol_version_supported(3, &config));
    }
}
