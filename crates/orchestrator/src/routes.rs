use crate::config::CorsOrigins;
use crate::handlers::{health, node_channel, subscriber_channel};
use crate::state::AppState;
use axum::http::{header, Method};
use axum::routing::get;
use axum::Router;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Wires every externally visible route onto one router, in the teacher's
/// layered style: CORS and request tracing as outer layers, health checks
/// unauthenticated, both WebSocket upgrades gated inside their own
/// handlers (§6 External interfaces).
pub fn build_router(state: AppState) -> Router {
    let cors = match &state.config.cors_origins {
        CorsOrigins::Any => CorsLayer::new().allow_origin(AllowOrigin::any()),
        CorsOrigins::List(origins) => {
            let parsed = origins.iter().filter_map(|o| o.parse().ok()).collect::<Vec<_>>();
            CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
        }
    }
    .allow_methods([Method::GET, Method::POST])
    .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(health::metrics))
        .route("/ws/node", get(node_channel::upgrade))
        .route("/ws/stream", get(subscriber_channel::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
