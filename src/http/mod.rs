//! Minimal axum router: the WebSocket endpoint plus a liveness probe.
//! `spec.md` §6 scopes the external interface down to these two routes —
//! no REST/admin/export surface, unlike the teacher's `build_router`.

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::session::ws_handler;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
