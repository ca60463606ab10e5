//! WebSocket transport for distributed connections.

use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde_json::Value;
use tokio::sync::Mutex;

use distws_core::{Error, Result, Transport};

/// Outgoing half of an upgraded WebSocket.
///
/// Payloads are written as JSON text frames. The read half stays with the
/// route handler.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, payload: &Value) -> Result<()> {
        let text = serde_json::to_string(payload)
            .map_err(|e| Error::Transport(format!("failed to encode payload: {}", e)))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn close(&self, code: u16) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(""),
        })))
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
        sink.close()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}
