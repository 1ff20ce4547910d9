use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tether_core::ids::Principal;
use tether_core::protocol::ServerMessage;
use tether_engine::{Controller, Planner};
use tether_store::JobStore;
use tether_telemetry::MetricsRecorder;

use crate::auth::{extract_token, TokenAuthenticator};
use crate::config::TetherConfig;
use crate::error::ServerError;
use crate::event_bridge;
use crate::handlers::{self, AppState, SessionContext};
use crate::sessions::{self, Disconnect, SessionRegistry};

pub fn build_router(state: AppState, http_timeout: Duration) -> Router {
    Router::new()
        .route("/v2/ws/agent", get(ws_handler))
        .route("/health", get(health_handler).layer(TimeoutLayer::new(http_timeout)))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Wire the controller, registry and background tasks, then start serving.
pub async fn start(
    config: &TetherConfig,
    store: Arc<JobStore>,
    planner: Arc<dyn Planner>,
) -> Result<ServerHandle, ServerError> {
    let metrics = Arc::new(MetricsRecorder::new());
    let controller = Arc::new(Controller::new(
        store,
        planner,
        config.controller.clone(),
        metrics.clone(),
    ));
    let recovered = controller.recover()?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "jobs from a previous run are paused and resumable");
    }
    controller.spawn_maintenance();

    let (registry, disconnects) = SessionRegistry::new(
        config.server.max_send_queue,
        config.server.heartbeat_timeout(),
        metrics.clone(),
    );
    let registry = Arc::new(registry);
    let cancel = CancellationToken::new();

    let bridge = event_bridge::create_bridge(Arc::clone(&registry), controller.subscribe());
    let sweep = sessions::start_sweep_task(
        Arc::clone(&registry),
        config.server.sweep_interval(),
        cancel.child_token(),
    );
    let pauser = start_disconnect_task(Arc::clone(&controller), disconnects, cancel.child_token());

    let state = AppState {
        controller,
        sessions: registry,
        auth: Arc::new(TokenAuthenticator::new(&config.auth.tokens)),
        metrics,
        heartbeat_interval: config.server.heartbeat_interval(),
    };

    let router = build_router(state.clone(), Duration::from_secs(config.server.http_timeout_secs.max(1)));
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "tether server started");

    let stop = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        cancel,
        server,
        bridge,
        sweep,
        pauser,
    })
}

/// Keeps the server's tasks alive until [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    pub state: AppState,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    bridge: JoinHandle<()>,
    sweep: JoinHandle<()>,
    pauser: JoinHandle<()>,
}

impl ServerHandle {
    /// Pause running jobs, then stop accepting connections.
    pub async fn shutdown(self) {
        self.state.controller.shutdown().await;
        self.cancel.cancel();
        let _ = self.sweep.await;
        let _ = self.pauser.await;
        let _ = self.server.await;
        self.bridge.abort();
        info!("tether server stopped");
    }
}

fn start_disconnect_task(
    controller: Arc<Controller>,
    mut disconnects: mpsc::UnboundedReceiver<Disconnect>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = disconnects.recv() => {
                    let Some(event) = event else { break };
                    let paused = controller.disconnected(&event.session_id).await;
                    info!(
                        session_id = %event.session_id,
                        reason = ?event.reason,
                        jobs = paused,
                        "session disconnected"
                    );
                }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = extract_token(query.token.as_deref(), authorization)
        .and_then(|token| state.auth.authenticate(&token));
    let Some(principal) = principal else {
        warn!(code = "UNAUTHORIZED", "rejected connection");
        return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

async fn handle_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let (session_id, rx) = state.sessions.register(principal.clone());
    info!(session_id = %session_id, principal = %principal, "session connected");
    handlers::send(
        &state,
        &session_id,
        &ServerMessage::Connected {
            session_id: session_id.clone(),
        },
    );

    let ctx = SessionContext {
        session_id: session_id.clone(),
        principal,
    };
    let handler_state = state.clone();
    sessions::handle_ws_connection(
        socket,
        session_id,
        rx,
        Arc::clone(&state.sessions),
        state.heartbeat_interval,
        move |text| {
            let state = handler_state.clone();
            let ctx = ctx.clone();
            async move { handlers::handle_text(&state, &ctx, &text).await }
        },
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.count(),
        "active_jobs": state.controller.active_jobs(),
        "metrics": state.metrics.snapshot(),
    }))
}
