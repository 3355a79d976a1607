use crate::auth;
use crate::errors::RouteError;
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use cnc_models::events::StreamEvent;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const CLOSE_NORMAL: u16 = 1000;

/// Upgrade gate for the operator/mobile subscriber channel (§4.4):
/// independent per-IP bucket, then a bearer token that must carry an
/// operator or admin role.
#[instrument(skip(websocket, state, headers))]
pub async fn upgrade(
    websocket: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let ip = remote_addr.ip();
    if state.nodes.subscriber_channel_count_for_ip(ip) >= state.config.ws_max_connections_per_ip {
        return RouteError::RateLimited.into_response();
    }

    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let protocol = headers.get(SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok());
    let token = match auth::extract_token(authorization, protocol, query.as_deref(), state.config.ws_allow_query_token_auth) {
        Some(token) => token,
        None => return RouteError::Unauthorized.into_response(),
    };
    if auth::authenticate_subscriber_channel(&state.config, &token).is_none() {
        return RouteError::Unauthorized.into_response();
    }

    state.nodes.increment_subscriber_channel(ip);
    websocket.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

/// Drives one subscriber connection: send the `connected` housekeeping
/// event, then fan out broadcast events until the broker closes or the
/// client disconnects (§4.4 Broadcast, Shutdown).
async fn handle_socket(socket: WebSocket, state: AppState, ip: IpAddr) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.streams.subscribe();

    let subscriber_id = Uuid::new_v4().to_string();
    let connected = StreamEvent::housekeeping("connected", Some(serde_json::json!({ "subscriber": subscriber_id })));
    if let Ok(text) = serde_json::to_string(&connected) {
        if sink.send(Message::Text(text)).await.is_err() {
            finish(&state, &mut sink, ip, CLOSE_NORMAL, "handshake-failed").await;
            return;
        }
    }
    info!(subscriber_id, %ip, "subscriber channel connected");

    let mut reader_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    let mut shutdown = state.shutdown.clone();
    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    let (close_code, close_reason) = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                break (CLOSE_NORMAL, "server-shutdown");
            }
            _ = &mut reader_task => {
                break (CLOSE_NORMAL, "client-disconnected");
            }
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break (CLOSE_NORMAL, "send-failed");
                }
            }
            received = events.recv() => {
                match received {
                    Ok(event) => {
                        if let Err(err) = send_event(&mut sink, &event).await {
                            warn!(subscriber_id, %err, "failed to deliver event to subscriber");
                            state.streams.record_send_failure();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(subscriber_id, skipped, "subscriber lagged behind the event broker");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break (CLOSE_NORMAL, "server-shutdown");
                    }
                }
            }
        }
    };

    reader_task.abort();
    finish(&state, &mut sink, ip, close_code, close_reason).await;
    info!(subscriber_id, %ip, "subscriber channel closed");
}

async fn send_event(sink: &mut futures::stream::SplitSink<WebSocket, Message>, event: &StreamEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(text)).await
}

async fn finish(state: &AppState, sink: &mut futures::stream::SplitSink<WebSocket, Message>, ip: IpAddr, code: u16, reason: &'static str) {
    let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
    state.streams.record_disconnect(code, reason);
    state.nodes.decrement_subscriber_channel(ip);
}
