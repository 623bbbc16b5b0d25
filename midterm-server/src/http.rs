//! HTTP + WebSocket surface (§6, §4.5). Routing and the attach handshake
//! are grounded on the sshx web handler's `ws.on_upgrade` pattern; session
//! CRUD endpoints are a thin JSON front for `SessionRegistry`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use midterm_proto::mux::MuxFrame;
use midterm_proto::session::SessionId;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::auth::{AllowAll, AuthGate};
use crate::mux::MuxRuntime;
use crate::registry::{CreateSessionRequest, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub auth: Arc<dyn AuthGate>,
}

impl AppState {
    #[must_use]
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry, auth: Arc::new(AllowAll) }
    }
}

#[must_use]
pub fn app(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", axum::routing::delete(close_session))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    match static_dir {
        Some(dir) => {
            let static_files = tower_http::services::ServeDir::new(dir);
            Router::new().nest("/api", api).fallback_service(static_files)
        }
        None => Router::new().nest("/api", api),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default = "default_cwd")]
    cwd: PathBuf,
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
    #[serde(default = "default_loglevel")]
    loglevel: String,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_cwd() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_loglevel() -> String {
    "info".to_string()
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot_all())
}

async fn create_session(State(state): State<AppState>, Json(body): Json<CreateSessionBody>) -> impl IntoResponse {
    let result = state
        .registry
        .create_session(CreateSessionRequest {
            shell: body.shell,
            cwd: body.cwd,
            cols: body.cols,
            rows: body.rows,
            loglevel: body.loglevel,
        })
        .await;

    match result {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let session_id = SessionId::from_raw(id);
    if state.registry.close_session(&session_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !state.auth.allow(&headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_mux_socket(socket, state.registry).await {
            tracing::warn!(error = %e, "mux websocket ended with error");
        }
    })
    .into_response()
}

/// Drives one browser WebSocket end to end: init frame, initial buffer
/// replay, then the fan-in/fan-out loop until the socket closes (§4.5).
async fn handle_mux_socket(mut socket: WebSocket, registry: SessionRegistry) -> anyhow::Result<()> {
    let client_id = uuid::Uuid::new_v4().to_string();
    socket.send(Message::Binary(MuxFrame::Init(client_id.into_bytes()).encode())).await?;

    let shutdown = registry.shutdown().clone();
    let runtime = MuxRuntime::new(registry, &shutdown);
    runtime.send_all_buffers().await;
    runtime.start();

    let queue = Arc::clone(runtime.queue());
    let result = drive_socket(&mut socket, &runtime, &queue).await;
    runtime.shutdown();
    let _ = socket.close().await;
    result
}

async fn drive_socket(
    socket: &mut WebSocket,
    runtime: &Arc<MuxRuntime>,
    queue: &Arc<crate::mux::MuxQueue>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = runtime.cancel_token().cancelled() => return Ok(()),
            outbound = queue.pop() => {
                match outbound {
                    Some(frame) => socket.send(Message::Binary(frame)).await?,
                    None => return Ok(()),
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        match midterm_proto::mux::decode_message(&bytes) {
                            Ok(frame) => runtime.handle_inbound(frame).await,
                            Err(e) => tracing::warn!(error = %e, "ignoring malformed mux frame"),
                        }
                        runtime.maybe_resync().await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {} // ignore text/ping/pong
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}
