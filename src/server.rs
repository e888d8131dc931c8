use crate::registry::SourceRegistry;
use crate::session::{run_session, SessionContext};
use crate::tracker::SessionInfo;
use crate::types::ServerMessage;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared state of the HTTP surface
#[derive(Clone)]
pub struct RelayState {
    pub context: SessionContext,
    pub start_time: Instant,
}

impl RelayState {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub transport: String,
    pub active_sessions: usize,
    pub uptime_seconds: u64,
}

/// Router with every relay endpoint; `cors_origins` of `*` allows any origin
pub fn create_router(state: RelayState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/ws", get(handle_websocket))
        .route("/health", get(health_check))
        .route("/api/sources", get(list_sources))
        .route("/api/sessions", get(list_sessions))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// WebSocket endpoint; one session per connection
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (sender, receiver) = socket.split();
    let summary = run_session(&state.context, sender, receiver).await;
    debug!("Session {} finished via {:?}", summary.id, summary.path);
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        transport: state.context.transport.name().to_string(),
        active_sessions: state.context.tracker.count(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Current catalog in the `stream_list` shape, 404 when nothing is announced
pub async fn list_sources(State(state): State<Arc<RelayState>>) -> Response {
    let registry = SourceRegistry::new(
        Arc::clone(&state.context.transport),
        state.context.config.discovery_timeout,
    );

    match registry.catalog().await {
        Ok(catalog) => {
            info!("Catalog requested: {} source(s)", catalog.len());
            (StatusCode::OK, Json(catalog.into_message())).into_response()
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ServerMessage::error(e.to_string())),
        )
            .into_response(),
    }
}

/// Live sessions, oldest first
pub async fn list_sessions(State(state): State<Arc<RelayState>>) -> Json<Vec<SessionInfo>> {
    Json(state.context.tracker.list())
}
