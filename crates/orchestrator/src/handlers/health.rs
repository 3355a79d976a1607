use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::json;

/// Liveness probe. Never checks the database round-trip: a degraded store
/// should still let the load balancer route traffic so in-flight node
/// channels aren't torn down.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Runtime metrics + broker/node counters, for operator dashboards (§4.7).
pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "commands": state.metrics.snapshot(),
        "stream": state.streams.stats(),
        "connectedNodes": state.nodes.connected_node_ids().len(),
        "inflightCommands": state.inflight.active_count(),
    }))
}
