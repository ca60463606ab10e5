use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use distws_core::ManagerState;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let manager = &state.manager;
    let status = if manager.state() == ManagerState::Started {
        "healthy"
    } else {
        "unavailable"
    };

    Json(json!({
        "status": status,
        "service": "distws-server",
        "version": env!("CARGO_PKG_VERSION"),
        "manager": {
            "state": manager.state().as_str(),
            "broker": manager.broker_name(),
            "channel": manager.channel(),
        },
        "connections": manager.connection_count(),
        "metrics": manager.metrics().to_json(),
    }))
}
