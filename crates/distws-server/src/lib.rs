//! distws server - WebSocket host for the distribution manager.
//!
//! This crate accepts WebSocket clients, authenticates the handshake and
//! hands each connection to a [`DistributionManager`](distws_core::DistributionManager):
//! - `GET /ws` - WebSocket endpoint (bearer token or `?token=`)
//! - `GET /health` - manager state, connection count and counters

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod transport;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

pub use error::{Error, Result};

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::routes())
        .merge(routes::ws::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
