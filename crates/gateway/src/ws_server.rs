//! WebSocket server handler using Axum.

use crate::cache::Cache;
use crate::conn::{Conn, ConnRegistry};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub cache: Arc<Cache>,
    pub registry: Arc<ConnRegistry>,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","connections":{},"resources":{}}}"#,
        state.registry.count(),
        state.cache.subscription_count()
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection: spawn the connection lane, forward
/// its outbound frames to the socket, and feed inbound frames onto it.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Frames serialized by the connection lane.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    // Control frames (ping/pong) sent by this handler.
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();

    let handle = Conn::spawn(state.cache.clone(), out_tx);
    let cid = handle.cid().to_string();
    state.registry.register(handle.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.count() as f64);

    // Forward messages from both channels to the socket.
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                msg = msg_rx.recv() => match msg {
                    Some(msg) => {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    // Ping interval for keepalive.
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            // Handle incoming WebSocket messages.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle.post_frame(text.to_string()),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => handle.post_frame(text),
                        Err(_) => debug!("{}: dropping non-UTF-8 binary frame", cid),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if msg_tx.send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", cid, e);
                        break;
                    }
                    None => break,
                }
            }

            // Send ping periodically.
            _ = ping_interval.tick() => {
                if msg_tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup.
    state.registry.unregister(&cid);
    handle.close();
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.count() as f64);

    info!("Client {} disconnected", cid);
}
