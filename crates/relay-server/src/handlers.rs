//! Connection handlers for the relay server.
//!
//! This module owns the WebSocket lifecycle: each accepted socket is
//! wrapped in a [`Transport`] and handed to a [`Client`], which drives
//! all protocol semantics. The read loop here only feeds decoded
//! commands into the client.

use crate::config::Config;
use crate::hooks::build_hooks;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use relay_core::{Client, Disconnect, Node, Transport, TransportError};
use relay_protocol::{codec, Command};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The messaging node.
    pub node: Arc<Node>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with a running node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node broker fails to start.
    pub fn new(config: Config) -> Result<Self> {
        let node = Node::new(config.engine_config());
        node.set_hooks(build_hooks(&config.channels));
        node.run()?;
        Ok(Self { node, config })
    }
}

/// WebSocket transport backed by an axum socket sink.
struct WsTransport {
    sender: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        metrics::record_frame(data.len(), "outbound");
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn write_many(&self, data: Vec<Bytes>) -> Result<(), TransportError> {
        let mut sender = self.sender.lock().await;
        for frame in data {
            metrics::record_frame(frame.len(), "outbound");
            sender
                .feed(Message::Binary(frame.to_vec()))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        sender
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self, disconnect: &Disconnect) -> Result<(), TransportError> {
        let mut sender = self.sender.lock().await;
        let frame = CloseFrame {
            code: disconnect.code as u16,
            reason: disconnect.reason.into(),
        };
        // Best effort, the peer may already be gone.
        let _ = sender.send(Message::Close(Some(frame))).await;
        Ok(())
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.websocket.path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket.path);

    let node = Arc::clone(&state.node);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            node.shutdown();
        })
        .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Split the WebSocket; the sink becomes the client's transport.
    let (sender, mut receiver) = socket.split();
    let transport = Arc::new(WsTransport {
        sender: tokio::sync::Mutex::new(sender),
    });

    let client = Client::new(Arc::clone(&state.node), transport);
    debug!(client = %client.id(), "WebSocket connected");

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let start = Instant::now();
                metrics::record_frame(data.len(), "inbound");
                read_buffer.extend_from_slice(&data);

                loop {
                    match codec::decode_from::<Command>(&mut read_buffer) {
                        Ok(Some(command)) => client.handle_command(command),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(client = %client.id(), error = %e, "Protocol error");
                            metrics::record_error("protocol");
                            client.close(&Disconnect::BAD_REQUEST);
                            break;
                        }
                    }
                }

                metrics::record_latency(start.elapsed().as_secs_f64());
            }
            Ok(Message::Text(_)) => {
                // The protocol is binary only.
                warn!(client = %client.id(), "Unexpected text frame");
                client.close(&Disconnect::BAD_REQUEST);
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Pongs are generated by the websocket layer.
            }
            Ok(Message::Close(_)) => {
                debug!(client = %client.id(), "Received close frame");
                break;
            }
            Err(e) => {
                debug!(client = %client.id(), error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }

        if client.is_closed() {
            break;
        }
    }

    // Idempotent, a no-op when the client closed itself already.
    client.close(&Disconnect::CONNECTION_CLOSED);
    metrics::set_active_channels(state.node.hub().channels().len());

    debug!(client = %client.id(), "WebSocket disconnected");
}
