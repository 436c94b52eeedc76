//! HTTP and WebSocket surface of the relay
//!
//! `GET /` upgrades to a relay connection speaking JSON frames,
//! `GET /health` and `GET /stats` report liveness and hub counters.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use pyramid_core::{RelayFrame, RelayServerConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::hub::{ConnectionId, HubStats, TopicHub};

#[derive(Clone)]
struct AppState {
    hub: TopicHub,
    config: Arc<RelayServerConfig>,
}

/// Rendezvous relay: WebSocket clients subscribe to topics and publish frames to them
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        let hub = TopicHub::new(config.max_topics_per_connection, config.outbound_buffer);
        Self {
            state: AppState {
                hub,
                config: Arc::new(config),
            },
        }
    }

    pub fn hub(&self) -> &TopicHub {
        &self.state.hub
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(websocket_handler))
            .route("/health", get(health))
            .route("/stats", get(stats))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("Relay listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("Relay shut down gracefully");
        Ok(())
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, mut outbound) = state.hub.connect();
    let (mut sink, mut stream) = socket.split();
    info!(connection_id = %connection_id, "Relay client connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&state.hub, &connection_id, text.as_str()),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(_) => {}
        }
    }

    // Removing the connection drops its queue, which ends the writer
    state.hub.disconnect(&connection_id);
    let _ = writer.await;
    info!(connection_id = %connection_id, "Relay client disconnected");
}

fn handle_frame(hub: &TopicHub, connection_id: &ConnectionId, text: &str) {
    let frame = match RelayFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Malformed relay frame");
            hub.notify(connection_id, format!("malformed frame: {e}"));
            return;
        }
    };

    match frame {
        RelayFrame::Subscribe { topic } => {
            if let Err(e) = hub.subscribe(connection_id, &topic) {
                hub.notify(connection_id, format!("subscribe rejected: {e}"));
            }
        }
        RelayFrame::Unsubscribe { topic } => hub.unsubscribe(connection_id, &topic),
        RelayFrame::Publish { topic, message } => {
            let kind = message.kind();
            let sent = hub.publish(connection_id, &topic, message);
            debug!(connection_id = %connection_id, topic = %topic, kind, sent, "Frame relayed");
        }
        RelayFrame::Message { .. } | RelayFrame::Notice { .. } => {
            hub.notify(connection_id, "clients may only subscribe, unsubscribe or publish");
        }
    }
}
