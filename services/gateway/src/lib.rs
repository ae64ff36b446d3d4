pub mod actor;
pub mod config;
pub mod ops;
pub mod router;
pub mod state;
pub mod subscriptions;
pub mod supervisor;
pub mod ws;

pub use config::GatewayConfig;
pub use state::AppState;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let ws_path = state.config.server.ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
