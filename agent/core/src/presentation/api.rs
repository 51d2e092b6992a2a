// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::application::console::ConsoleService;
use crate::application::error::{ErrorKind, ServiceError};
use crate::application::files::FileService;
use crate::application::lifecycle::{
    CreateServerCommand, LifecycleService, PowerAction, UpdateServerCommand,
};
use crate::application::telemetry::TelemetryService;
use crate::domain::access::Caller;
use crate::domain::blueprint::BlueprintId;
use crate::domain::server::{ResourceLimit, ServerAllocation, ServerId, UserId};

/// Header set by the authenticating proxy in front of the agent. Only honoured
/// on requests that also carry the backend token.
pub const USER_HEADER: &str = "x-hearth-user";

pub struct AppState {
    pub node_id: String,
    pub lifecycle: Arc<dyn LifecycleService>,
    pub console: Arc<ConsoleService>,
    pub telemetry: Arc<TelemetryService>,
    pub files: Arc<FileService>,
    /// Every request must present this bearer token. Without a user header
    /// the request acts as the backend; with one it acts for that user.
    pub backend_token: Option<String>,
    /// With no token configured, accept unauthenticated requests instead of
    /// refusing them.
    pub insecure_open_access: bool,
    pub start_time: Instant,
}

pub fn app(state: AppState) -> Router {
    let files = Router::new()
        .route("/", get(list_files).delete(delete_file))
        .route("/stat", get(stat_file))
        .route("/content", get(read_file).put(write_file))
        .route("/directory", post(create_directory))
        .route("/size", get(directory_size))
        .route("/move", post(move_file))
        .route("/copy", post(copy_file))
        .route("/permissions", get(file_permissions).put(chmod_file))
        .route("/search", get(search_files))
        .route("/compress", post(compress_files))
        .route("/decompress", post(decompress_file));

    Router::new()
        .route("/health", get(health))
        .route("/api/servers", post(create_server))
        .route(
            "/api/servers/{sid}",
            get(server_status).patch(update_server).delete(delete_server),
        )
        .route("/api/servers/{sid}/power", post(power))
        .route("/api/servers/{sid}/reinstall", post(reinstall))
        .route("/api/servers/{sid}/console", get(console_socket))
        .route("/api/servers/{sid}/terminal", get(terminal_socket))
        .route("/api/servers/{sid}/terminal/command", post(terminal_command))
        .route("/api/servers/{sid}/resources", get(resources_socket))
        .nest("/api/servers/{sid}/files", files)
        .with_state(Arc::new(state))
}

// ============================================================================
// Errors and caller identity
// ============================================================================

pub struct ApiError(ServiceError);

impl<E> From<E> for ApiError
where
    E: Into<ServiceError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
        ErrorKind::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        ErrorKind::Dependency => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
    }
}

fn error_body(err: &ServiceError) -> serde_json::Value {
    json!({ "error": err.to_string(), "kind": err.kind() })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind == ErrorKind::Internal {
            warn!(error = %self.0, "Request failed");
        }
        (status_for(kind), Json(error_body(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

fn resolve_caller(state: &AppState, headers: &HeaderMap) -> Result<Caller, ServiceError> {
    match (&state.backend_token, bearer_token(headers)) {
        (Some(expected), Some(token)) if expected == token => {}
        (Some(_), Some(_)) => {
            return Err(ServiceError::AccessDenied("invalid backend token".to_string()));
        }
        (Some(_), None) => {
            return Err(ServiceError::AccessDenied("missing backend token".to_string()));
        }
        (None, _) if state.insecure_open_access => {}
        (None, _) => {
            return Err(ServiceError::AccessDenied(
                "no backend token is configured on this node".to_string(),
            ));
        }
    }

    match headers.get(USER_HEADER) {
        Some(user) => {
            let user = user
                .to_str()
                .map_err(|_| ServiceError::Validation(format!("{} is not valid text", USER_HEADER)))?;
            Ok(Caller::User(UserId::new(user.trim())?))
        }
        None => Ok(Caller::Backend),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AllocationBody {
    pub ip: IpAddr,
    pub port: u16,
}

fn allocations(body: Vec<AllocationBody>) -> Result<Vec<ServerAllocation>, ServiceError> {
    body.into_iter()
        .map(|a| ServerAllocation::new(a.ip, a.port).map_err(ServiceError::from))
        .collect()
}

fn user_ids(body: Vec<String>) -> Result<Vec<UserId>, ServiceError> {
    body.into_iter()
        .map(|u| UserId::new(u).map_err(ServiceError::from))
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub sid: String,
    pub owner: String,
    #[serde(default)]
    pub users: Vec<String>,
    pub allocations: Vec<AllocationBody>,
    pub resource_limit: ResourceLimit,
    pub image: String,
    pub blueprint_id: String,
}

impl TryFrom<CreateServerRequest> for CreateServerCommand {
    type Error = ServiceError;

    fn try_from(req: CreateServerRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            sid: ServerId::new(req.sid)?,
            owner: UserId::new(req.owner)?,
            users: user_ids(req.users)?,
            allocations: allocations(req.allocations)?,
            resource_limit: req.resource_limit,
            image: req.image,
            blueprint_id: BlueprintId::new(req.blueprint_id)?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateServerRequest {
    pub users: Option<Vec<String>>,
    pub allocations: Option<Vec<AllocationBody>>,
    pub resource_limit: Option<ResourceLimit>,
    pub image: Option<String>,
    pub blueprint_id: Option<String>,
}

impl TryFrom<UpdateServerRequest> for UpdateServerCommand {
    type Error = ServiceError;

    fn try_from(req: UpdateServerRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            users: req.users.map(user_ids).transpose()?,
            allocations: req.allocations.map(allocations).transpose()?,
            resource_limit: req.resource_limit,
            image: req.image,
            blueprint_id: req.blueprint_id.map(BlueprintId::new).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub action: PowerAction,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "node_id": state.node_id,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

async fn create_server(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateServerRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers)?;
    let server = state.lifecycle.create_server(&caller, body.try_into()?).await?;
    Ok((StatusCode::ACCEPTED, Json(server)))
}

async fn server_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers)?;
    let server = state.lifecycle.status(&caller, &ServerId::new(sid)?).await?;
    Ok(Json(server))
}

async fn update_server(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<UpdateServerRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers)?;
    let server = state
        .lifecycle
        .update_server(&caller, &ServerId::new(sid)?, body.try_into()?)
        .await?;
    Ok(Json(server))
}

async fn delete_server(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers)?;
    state
        .lifecycle
        .delete_server(&caller, &ServerId::new(sid)?, query.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn power(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<PowerRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers)?;
    let server = state
        .lifecycle
        .power(&caller, &ServerId::new(sid)?, body.action)
        .await?;
    Ok(Json(server))
}

async fn reinstall(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers)?;
    let server = state.lifecycle.reinstall(&caller, &ServerId::new(sid)?).await?;
    Ok((StatusCode::ACCEPTED, Json(server)))
}

// ============================================================================
// Streams
// ============================================================================

/// Bridge a WebSocket onto a pair of line channels and run `relay` over
/// them. Text frames go inbound; every outbound line becomes a text frame.
/// A relay error is reported as a final JSON frame before close.
async fn bridge_socket<F, Fut>(socket: WebSocket, stream: &'static str, relay: F)
where
    F: FnOnce(mpsc::Receiver<String>, mpsc::Sender<String>) -> Fut,
    Fut: Future<Output = Result<(), ServiceError>>,
{
    let (mut sink, mut source) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(256);
    let error_tx = outbound_tx.clone();

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = source.next().await {
            match message {
                Message::Text(text) => {
                    if inbound_tx.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if sink.send(Message::Text(line.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    if let Err(e) = relay(inbound_rx, outbound_tx).await {
        debug!(stream, error = %e, "Stream ended with error");
        let _ = error_tx.send(error_body(&e).to_string()).await;
    }
    drop(error_tx);

    reader.abort();
    let _ = writer.await;
}

async fn console_socket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let caller = resolve_caller(&state, &headers)?;
    let sid = ServerId::new(sid)?;
    Ok(ws.on_upgrade(move |socket| async move {
        bridge_socket(socket, "console", |inbound, outbound| async move {
            state.console.console(&caller, &sid, inbound, outbound).await
        })
        .await
    }))
}

async fn terminal_socket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let caller = resolve_caller(&state, &headers)?;
    let sid = ServerId::new(sid)?;
    Ok(ws.on_upgrade(move |socket| async move {
        bridge_socket(socket, "terminal", |inbound, outbound| async move {
            state.console.terminal(&caller, &sid, inbound, outbound).await
        })
        .await
    }))
}

async fn resources_socket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let caller = resolve_caller(&state, &headers)?;
    let sid = ServerId::new(sid)?;
    Ok(ws.on_upgrade(move |socket| async move {
        bridge_socket(socket, "telemetry", |_inbound, outbound| async move {
            let (usage_tx, mut usage_rx) = mpsc::channel(16);
            let forward = async move {
                while let Some(usage) = usage_rx.recv().await {
                    let Ok(frame) = serde_json::to_string(&usage) else {
                        continue;
                    };
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
            };
            let (result, ()) = tokio::join!(
                state.telemetry.resource_usage(&caller, &sid, usage_tx),
                forward
            );
            result
        })
        .await
    }))
}

#[derive(Debug, Deserialize)]
pub struct TerminalCommandRequest {
    pub command: String,
}

async fn terminal_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<TerminalCommandRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers)?;
    state
        .console
        .terminal_command(&caller, &ServerId::new(sid)?, &body.command)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Files
// ============================================================================

fn root_path() -> String {
    "/".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default = "root_path")]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default = "root_path")]
    pub path: String,
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct PathBody {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct ChmodBody {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Deserialize)]
pub struct CompressBody {
    pub paths: Vec<String>,
    pub archive: String,
}

#[derive(Debug, Deserialize)]
pub struct DecompressBody {
    pub archive: String,
    pub into: String,
}

async fn open_volume(
    state: &AppState,
    headers: &HeaderMap,
    sid: String,
) -> Result<crate::application::files::ServerVolume, ServiceError> {
    let caller = resolve_caller(state, headers)?;
    state.files.open(&caller, &ServerId::new(sid)?).await
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    Ok(Json(volume.list(&query.path).await?))
}

async fn stat_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    Ok(Json(volume.stat(&query.path).await?))
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    let content = volume.read(&query.path).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], content))
}

async fn write_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.write(&query.path, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.delete(&query.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_directory(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<PathBody>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.create_directory(&body.path).await?;
    Ok(StatusCode::CREATED)
}

async fn directory_size(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    let bytes = volume.directory_size(&query.path).await?;
    Ok(Json(json!({ "path": query.path, "bytes": bytes })))
}

async fn move_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<TransferBody>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.move_path(&body.from, &body.to).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn copy_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<TransferBody>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.copy(&body.from, &body.to).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn file_permissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    let mode = volume.permissions(&query.path).await?;
    Ok(Json(json!({ "path": query.path, "mode": mode })))
}

async fn chmod_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<ChmodBody>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.chmod(&body.path, body.mode).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn search_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    Ok(Json(volume.search(&query.path, &query.query).await?))
}

async fn compress_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<CompressBody>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.compress(&body.paths, &body.archive).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn decompress_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sid): Path<String>,
    Json(body): Json<DecompressBody>,
) -> ApiResult<impl IntoResponse> {
    let volume = open_volume(&state, &headers, sid).await?;
    volume.decompress(&body.archive, &body.into).await?;
    Ok(StatusCode::NO_CONTENT)
}
