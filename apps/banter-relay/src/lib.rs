pub mod config;
pub mod handlers;
pub mod pending;
pub mod rate_limit;
pub mod relay;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use relay::RelayState;

/// Build the full relay router over a prepared state. Split out of `main` so
/// integration tests can serve the relay on an ephemeral port.
pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/pending", get(handlers::list_pending))
        .route("/ws/:user_id", get(relay::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
