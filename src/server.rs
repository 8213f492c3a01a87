//! HTTP and WebSocket surface for operators.
//!
//! Routes:
//! - `GET /health`
//! - `POST /chat` answers `{message}` with `{type, message, timestamp}`
//! - `GET /chat-history`
//! - `GET /sensor-summary`
//! - `GET /stats`
//! - `GET /ws` registers a broadcast listener for the connection's lifetime
//!
//! ```text
//! operator ──→ POST /chat ──→ correlator ──→ bus (chat request)
//!     ↑                           │
//!     └──── /ws broadcast ←───────┘←── bus (chat response)
//! ```

use crate::broadcast::ChannelListener;
use crate::chat::{run_deadline_sweeper, ChatError, ChatReply, HistoryEntry};
use crate::pipeline::{Pipeline, SensorSummary};
use crate::stats::StatsSnapshot;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: IpAddr,
    /// Port to bind to (0 for random)
    pub port: u16,
    /// How often overdue chat exchanges are swept
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Loopback-only server on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            sweep_interval: Duration::from_secs(1),
        }
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }
}

/// Chat request body
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub listeners: usize,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
}

/// Inbound WebSocket frame
#[derive(Debug, Deserialize)]
struct SocketFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// GET /health
async fn health(State(pipeline): State<Arc<Pipeline>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: pipeline.config().node_id.clone(),
        listeners: pipeline.broadcast().len(),
    })
}

/// POST /chat
///
/// Answers immediately from the fallback; the reasoning service's answer
/// follows later over `/ws`.
async fn chat(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    pipeline
        .correlator()
        .ask(&request.message)
        .map(Json)
        .map_err(chat_error)
}

fn chat_error(e: ChatError) -> ApiError {
    let (status, code) = match e {
        ChatError::EmptyMessage => (StatusCode::BAD_REQUEST, "EMPTY_MESSAGE"),
        ChatError::MalformedAnswer(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CHAT_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
}

/// GET /chat-history
async fn chat_history(State(pipeline): State<Arc<Pipeline>>) -> Json<HistoryResponse> {
    Json(HistoryResponse {
        history: pipeline.correlator().history(),
    })
}

/// GET /sensor-summary
async fn sensor_summary(State(pipeline): State<Arc<Pipeline>>) -> Json<SensorSummary> {
    Json(pipeline.sensor_summary())
}

/// GET /stats
async fn stats(State(pipeline): State<Arc<Pipeline>>) -> Json<StatsSnapshot> {
    Json(pipeline.stats().snapshot())
}

/// GET /ws
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(pipeline): State<Arc<Pipeline>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, pipeline))
}

async fn serve_socket(mut socket: WebSocket, pipeline: Arc<Pipeline>) {
    let (tx, mut outbound) = tokio::sync::mpsc::unbounded_channel();
    let handle = pipeline
        .broadcast()
        .register(Arc::new(ChannelListener::new(tx)));

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(text) = message else { break };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = answer_frame(&pipeline, &text) {
                        if socket.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    pipeline.broadcast().unregister(handle);
}

/// Answer a chat frame on the socket that sent it.
fn answer_frame(pipeline: &Pipeline, text: &str) -> Option<String> {
    let frame: SocketFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("ignoring undecodable socket frame: {e}");
            return None;
        }
    };
    if frame.kind != "chat" {
        return None;
    }

    let reply = match pipeline.correlator().answer(&frame.message) {
        Ok(reply) => serde_json::to_value(&reply).ok()?,
        Err(e) => serde_json::json!({ "type": "error", "message": e.to_string() }),
    };
    Some(reply.to_string())
}

/// Build the router.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/chat-history", get(chat_history))
        .route("/sensor-summary", get(sensor_summary))
        .route("/stats", get(stats))
        .route("/ws", get(ws_upgrade))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(pipeline)
}

/// Run the HTTP server and the chat deadline sweeper.
pub async fn run(
    config: ServerConfig,
    pipeline: Arc<Pipeline>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(pipeline.clone());

    let addr = SocketAddr::new(config.host, config.port);
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Copilot server listening on http://{}", actual_addr);

    let sweeper = tokio::spawn(run_deadline_sweeper(
        pipeline.correlator().clone(),
        config.sweep_interval,
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
        sweeper.abort();
    });

    Ok((actual_addr, shutdown_tx))
}
