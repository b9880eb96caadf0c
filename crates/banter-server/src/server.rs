//! Router, state, and server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use banter_core::profile::{IdentityStore, ProfileChanges, ProfileRecord};
use banter_directory::{Directory, DirectoryError};
use banter_hub::{Hub, HubHandle, Session};

use crate::config::ServerConfig;
use crate::health::health_check;
use crate::websocket;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub hub: HubHandle,
    pub directory: Arc<Directory>,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/accounts", post(create_account))
        .route("/accounts/{email}", get(get_account).put(update_account))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Handle returned by [`start`] — keeps the server task alive and exposes
/// the bound address.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub hub: HubHandle,
    _server: tokio::task::JoinHandle<()>,
}

/// Spawn the hub, bind, and serve. Returns once the listener is bound.
pub async fn start(
    config: ServerConfig,
    directory: Arc<Directory>,
) -> Result<ServerHandle, std::io::Error> {
    let identities: Arc<dyn IdentityStore> = directory.clone();
    let hub = Hub::spawn(identities);

    let state = AppState {
        config: config.clone(),
        hub: hub.clone(),
        directory,
        started_at: Instant::now(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    info!(%addr, "banter server started");

    Ok(ServerHandle {
        addr,
        hub,
        _server: server,
    })
}

#[derive(Deserialize)]
struct ConnectParams {
    /// Account identifier, presumed already verified by an external gate.
    account: String,
}

/// WebSocket upgrade: resolve the verified identity, then hand the
/// connection to the hub.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(record) = state.directory.get(&params.account) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unknown account"})),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, record))
        .into_response()
}

/// Accept path: create the session, register it (which replays history),
/// then run the pumps until the connection dies.
async fn handle_socket(socket: WebSocket, state: AppState, record: ProfileRecord) {
    let (session, rx) = Session::new(record, state.config.send_queue_size);
    let session_id = session.id().clone();
    let profile = session.profile();

    if state.hub.register(session).await.is_err() {
        return;
    }

    websocket::run_ws_session(socket, session_id, profile, rx, state.hub.clone()).await;
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.hub.snapshot().await {
        Ok(snapshot) => Json(health_check(state.started_at, snapshot)).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded"})),
        )
            .into_response(),
    }
}

/// Provision a new account record.
async fn create_account(
    State(state): State<AppState>,
    Json(record): Json<ProfileRecord>,
) -> Response {
    match state.directory.create(record.clone()) {
        Ok(()) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => directory_error(err),
    }
}

async fn get_account(State(state): State<AppState>, Path(email): Path<String>) -> Response {
    match state.directory.get(&email) {
        Some(record) => Json(record).into_response(),
        None => directory_error(DirectoryError::UnknownAccount(email)),
    }
}

/// Profile-update collaborator: persist the change, then signal the hub
/// with the previous identifier exactly once.
async fn update_account(
    State(state): State<AppState>,
    Path(email): Path<String>,
    Json(changes): Json<ProfileChanges>,
) -> Response {
    match state.directory.update(&email, changes) {
        Ok(update) => {
            let _ = state
                .hub
                .notify_identity_changed(update.previous_email.clone())
                .await;
            Json(update.record).into_response()
        }
        Err(err) => directory_error(err),
    }
}

fn directory_error(err: DirectoryError) -> Response {
    let status = match &err {
        DirectoryError::EmailTaken(_) => StatusCode::CONFLICT,
        DirectoryError::UnknownAccount(_) => StatusCode::NOT_FOUND,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
