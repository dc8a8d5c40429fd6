//! HTTP API and push channel server built on axum.

use super::connection::{ConnectionManager, ConnectionStats};
use super::envelope::ApiEnvelope;
use super::events::{CAPACITY_FULL, ClientMessage, PARSE_ERROR, ServerMessage};
use crate::config::{LabfeedConfig, ServerConfig};
use crate::error::LabfeedError;
use crate::query::QueryService;
use crate::relay::ChangeRelay;
use crate::store::DocumentStore;
use crate::types::{Document, ExperimentDetail};
use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    handler::HandlerWithoutStateExt,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Body of every unmatched route.
pub const NOT_FOUND_TEXT: &str = "Not found, please check the URL.";

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    query: QueryService,
    relay: ChangeRelay,
    connections: Arc<Mutex<ConnectionManager>>,
    feed_buffer: usize,
    backend: &'static str,
    started_at: chrono::DateTime<Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("backend", &self.backend)
            .field("feed_buffer", &self.feed_buffer)
            .finish()
    }
}

impl AppState {
    /// Build handler state over `store`.
    pub fn new(store: Arc<dyn DocumentStore>, config: &ServerConfig) -> Self {
        Self {
            backend: store.backend(),
            query: QueryService::new(Arc::clone(&store)),
            relay: ChangeRelay::new(store),
            connections: Arc::new(Mutex::new(ConnectionManager::new(config.max_connections))),
            feed_buffer: config.feed_buffer,
            started_at: Utc::now(),
        }
    }

    /// Number of live push connections.
    pub async fn active_connections(&self) -> usize {
        self.connections.lock().await.active_count()
    }

    /// Snapshot of the connection registry.
    pub async fn connection_stats(&self) -> ConnectionStats {
        self.connections.lock().await.stats()
    }

    /// Seconds since the state was built.
    pub fn uptime_secs(&self) -> u64 {
        let elapsed = Utc::now() - self.started_at;
        elapsed.num_seconds().max(0) as u64
    }
}

/// Build the application router.
///
/// The experiment routes are served both at the root and under `/api`.
/// Unmatched paths fall through to `static_dir` when given, then to a 404.
pub fn router(state: AppState, static_dir: Option<&std::path::Path>) -> Router {
    let api = Router::new()
        .route("/experiments", get(list_experiments))
        .route("/experiments/{id}", get(get_experiment));

    let app = Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler));

    let app = match static_dir {
        Some(dir) => {
            app.fallback_service(ServeDir::new(dir).not_found_service(handle_404.into_service()))
        }
        None => app.fallback(handle_404),
    };

    app.layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin),
        )
        .with_state(state)
}

async fn list_experiments(State(state): State<AppState>) -> ApiEnvelope<Vec<Document>> {
    let result = state.query.list_experiments().await;
    if let Err(e) = &result {
        warn!(error = %e, "listExperiments failed");
    }
    result.into()
}

async fn get_experiment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiEnvelope<Option<ExperimentDetail>> {
    let result = state.query.get_experiment(&id).await;
    if let Err(e) = &result {
        warn!(experiment_id = %id, error = %e, "getExperiment failed");
    }
    result.into()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.connection_stats().await;
    let oldest_connection_secs = stats
        .oldest_connected_at
        .map(|at| (Utc::now() - at).num_seconds().max(0));
    Json(serde_json::json!({
        "status": "ok",
        "store": state.backend,
        "connections": stats.active,
        "max_connections": stats.max,
        "oldest_connection_secs": oldest_connection_secs,
        "last_activity": stats.last_activity,
        "uptime_secs": state.uptime_secs(),
    }))
}

async fn handle_404() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND_TEXT)
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "Unknown panic".to_string()
    };
    error!(error = %message, "Request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "err": message })),
    )
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = socket.split();
    drive_connection(tx, rx, state).await;
}

/// Run one push connection until the client goes away.
///
/// Registers the connection, attaches a relay, then multiplexes change
/// feeds out and client frames in. The relay is closed and the connection
/// unregistered on every exit path.
async fn drive_connection<Tx, Rx, E>(mut tx: Tx, mut rx: Rx, state: AppState)
where
    Tx: Sink<WsMessage> + Unpin,
    Rx: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    let registered = state.connections.lock().await.add_connection();
    let Some(conn_id) = registered else {
        warn!("Rejecting push client: connection limit reached");
        let _ = send(
            &mut tx,
            &ServerMessage::error(CAPACITY_FULL, "Server at maximum connections"),
        )
        .await;
        let _ = tx.close().await;
        return;
    };
    info!(connection_id = %conn_id, "Push client connected");

    let (feed_tx, mut feed_rx) = mpsc::channel(state.feed_buffer);
    let mut relay = state.relay.attach(feed_tx).await;

    let mut feed_open = true;
    loop {
        tokio::select! {
            feed = feed_rx.recv(), if feed_open => match feed {
                Some(feed) => {
                    if send(&mut tx, &ServerMessage::ChangeFeed(feed)).await.is_err() {
                        break;
                    }
                }
                None => feed_open = false,
            },
            frame = rx.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(connection_id = %conn_id, error = %e, "Push socket error");
                        break;
                    }
                };
                state.connections.lock().await.touch(&conn_id);
                let reply = handle_client_frame(text.as_str());
                if send(&mut tx, &reply).await.is_err() {
                    break;
                }
            }
        }
    }

    relay.close().await;
    state.connections.lock().await.remove_connection(&conn_id);
    info!(connection_id = %conn_id, "Push client disconnected");
}

fn handle_client_frame(text: &str) -> ServerMessage {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping { timestamp }) => ServerMessage::Pong { timestamp },
        Err(e) => ServerMessage::error(PARSE_ERROR, format!("Invalid message: {e}")),
    }
}

async fn send<Tx>(tx: &mut Tx, msg: &ServerMessage) -> Result<(), ()>
where
    Tx: Sink<WsMessage> + Unpin,
{
    let json = serde_json::to_string(msg).map_err(|e| {
        error!(error = %e, "Failed to serialize push message");
    })?;
    tx.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

/// Prepare the store and serve the API until `shutdown` resolves.
pub async fn serve<F>(
    config: &LabfeedConfig,
    store: Arc<dyn DocumentStore>,
    shutdown: F,
) -> Result<(), LabfeedError>
where
    F: Future<Output = ()> + Send + 'static,
{
    store.open_session().await?.ensure_collections().await?;

    let state = AppState::new(store, &config.server);
    let app = router(state, config.server.static_dir.as_deref());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "labfeed listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("labfeed stopped");
    Ok(())
}
