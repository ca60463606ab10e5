//! WebSocket endpoint.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use distws_core::{Connection, Transport};
use distws_proto::close_codes;

use crate::auth::credential;
use crate::state::AppState;
use crate::transport::WsTransport;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Authenticate the handshake, then upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let presented = credential(&headers, params.token.as_deref());
    let token = match state.auth.authenticate(presented) {
        Ok(token) => token,
        Err(e) => {
            tracing::info!(error = %e, "rejected websocket handshake");
            return e.into_response();
        }
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, token.is_some())),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, authenticated: bool) {
    let (sink, mut stream) = socket.split();
    let transport = Arc::new(WsTransport::new(sink));
    let id = Uuid::new_v4().to_string();

    let connection = match state.manager.new_connection(transport.clone(), id.clone()) {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(connection_id = %id, error = %e, "could not register connection");
            if let Err(e) = transport.close(close_codes::INTERNAL_ERROR).await {
                tracing::debug!(connection_id = %id, error = %e, "close after failed registration");
            }
            return;
        }
    };

    tracing::info!(connection_id = %id, authenticated, "client connected");

    while let Some(frame) = stream.next().await {
        // Shed by the manager for falling behind.
        if !connection.is_open() {
            break;
        }
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                report_error(
                    &state,
                    &connection,
                    "protocol",
                    "binary frames are not supported",
                    true,
                );
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "websocket read failed");
                break;
            }
        };

        if let Err(e) = state.manager.receive(&connection, &text).await {
            let kind = e.kind();
            report_error(
                &state,
                &connection,
                kind.as_str(),
                &e.to_string(),
                kind.is_client_error(),
            );
        }
    }

    state.manager.remove_connection(&connection);
    tracing::info!(
        connection_id = %id,
        delivered = connection.delivered_count(),
        "client disconnected"
    );
}

/// Queue an error frame for the client, behind its pending deliveries.
fn report_error(
    state: &AppState,
    connection: &Arc<Connection>,
    kind: &str,
    message: &str,
    client_error: bool,
) {
    if client_error {
        tracing::debug!(connection_id = %connection.id(), kind, message, "rejected client frame");
    } else {
        tracing::warn!(connection_id = %connection.id(), kind, message, "failed to handle client frame");
    }

    let frame = json!({
        "type": "error",
        "kind": kind,
        "message": message,
    });
    if let Err(e) = state.manager.reply(connection, frame) {
        tracing::debug!(connection_id = %connection.id(), error = %e, "could not report error");
    }
}
