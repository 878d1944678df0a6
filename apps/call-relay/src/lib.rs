//! The call relay: a websocket hub that stamps each envelope with its
//! sender's joined identity and forwards it to the other member of the room.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod websocket;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::RelayConfig;
pub use websocket::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
