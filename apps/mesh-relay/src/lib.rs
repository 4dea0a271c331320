//! Signaling relay for a full-mesh of peers.
//!
//! Clients connect over a WebSocket at `/ws`, claim a unique identity, and
//! are paired with every other participant once they report `ready`. After
//! that the relay only forwards opaque negotiation payloads between
//! identities and announces departures.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod websocket;

use std::net::SocketAddr;

use axum::{extract::connect_info::IntoMakeServiceWithConnectInfo, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use registry::{HandleId, Registry, RegistryError};
pub use websocket::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(handlers::health_check))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// The router wrapped so handlers can see each client's socket address.
pub fn app(state: RelayState) -> IntoMakeServiceWithConnectInfo<Router, SocketAddr> {
    router(state).into_make_service_with_connect_info::<SocketAddr>()
}
