//! HTTP API of the local sandbox service, using Axum.

use crate::api::{
    CommandResult, CreateSandboxRequest, ExecRequest, FileContent, FileQuery, HealthStatus,
    PreviewLink, SandboxInfo, DEFAULT_EXEC_TIMEOUT_SECS,
};
use crate::sandbox::{self, RunConfig};
use crate::state::{AppState, Sandbox, Sandboxes};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

type ApiError = (StatusCode, String);

/// Build the service router. Everything except `/health` requires the bearer
/// token when one is configured.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route("/sandboxes/:id", get(get_sandbox).delete(delete_sandbox))
        .route("/sandboxes/:id/exec", post(exec))
        .route("/sandboxes/:id/files", get(read_file).put(write_file))
        .route("/sandboxes/:id/ports/:port/preview", get(preview))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given address with the provided state.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    if let Some(ttl) = state.config.idle_ttl {
        let sandboxes = state.sandboxes.clone();
        tokio::spawn(async move {
            let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
            let mut interval = interval(period);
            loop {
                interval.tick().await;
                cleanup_idle_sandboxes(&sandboxes, ttl).await;
            }
        });
    }

    warn!(
        "Local sandboxes share this host's process table and ports; kill patterns \
         run in one sandbox also reach other sandboxes and this user's processes"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(key) = &state.config.api_key {
        let expected = format!("Bearer {}", key.expose());
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(request).await)
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy".to_string(),
        service: "sandboxctl".to_string(),
        sandboxes: state.sandboxes.read().await.len(),
    })
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(req): Json<CreateSandboxRequest>,
) -> Result<Json<SandboxInfo>, ApiError> {
    let sandbox_id = uuid::Uuid::new_v4().to_string();

    let root = tokio::task::spawn_blocking({
        let base = state.config.root.clone();
        let sandbox_id = sandbox_id.clone();
        move || sandbox::create_sandbox_dir(&base, &sandbox_id)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;

    let now = Instant::now();
    let entry = Sandbox {
        id: sandbox_id.clone(),
        root,
        labels: req.labels,
        created_at: now,
        last_used: now,
    };
    let info = entry.info(now);

    state.sandboxes.write().await.insert(sandbox_id.clone(), entry);
    info!("Created sandbox: {}", sandbox_id);

    Ok(Json(info))
}

async fn list_sandboxes(State(state): State<AppState>) -> Json<Vec<SandboxInfo>> {
    let sandboxes = state.sandboxes.read().await;
    let now = Instant::now();
    let mut list: Vec<SandboxInfo> = sandboxes.values().map(|s| s.info(now)).collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    Json(list)
}

async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SandboxInfo>, ApiError> {
    let sandboxes = state.sandboxes.read().await;
    let sandbox = sandboxes.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(sandbox.info(Instant::now())))
}

async fn delete_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state.sandboxes.write().await.remove(&id);
    let sandbox = removed.ok_or_else(|| not_found(&id))?;
    tokio::task::spawn_blocking(move || sandbox::destroy_sandbox(&sandbox.root));
    info!("Deleted sandbox: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

/// Look up a sandbox root and mark the sandbox as used.
async fn touch(state: &AppState, id: &str) -> Result<PathBuf, ApiError> {
    let mut sandboxes = state.sandboxes.write().await;
    let sandbox = sandboxes.get_mut(id).ok_or_else(|| not_found(id))?;
    sandbox.last_used = Instant::now();
    Ok(sandbox.root.clone())
}

async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<CommandResult>, ApiError> {
    let root = touch(&state, &id).await?;
    info!("POST /sandboxes/{}/exec - command: {:?}", id, req.command);

    let config = RunConfig {
        command: req.command,
        cwd: req.cwd,
        env: req.env,
        timeout: Duration::from_secs(req.timeout_secs.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS)),
        limits: state.config.limits,
    };
    let result = sandbox::run_in_sandbox(&root, &config)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    info!("POST /sandboxes/{}/exec - exit={}", id, result.exit_code);
    Ok(Json(result))
}

async fn write_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FileContent>,
) -> Result<StatusCode, ApiError> {
    let root = touch(&state, &id).await?;
    let content = STANDARD
        .decode(req.content_base64.as_bytes())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("content_base64: {}", e)))?;

    tokio::task::spawn_blocking(move || sandbox::write_file_in_sandbox(&root, &req.path, &content))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn read_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<FileContent>, ApiError> {
    let root = touch(&state, &id).await?;
    let path = query.path.clone();
    let content = tokio::task::spawn_blocking(move || sandbox::read_file_in_sandbox(&root, &path))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| (StatusCode::NOT_FOUND, e))?;

    Ok(Json(FileContent {
        path: query.path,
        content_base64: STANDARD.encode(content),
    }))
}

async fn preview(
    State(state): State<AppState>,
    Path((id, port)): Path<(String, u16)>,
) -> Result<Json<PreviewLink>, ApiError> {
    touch(&state, &id).await?;
    Ok(Json(PreviewLink {
        port,
        url: format!("http://{}:{}", state.config.public_host, port),
    }))
}

fn not_found(id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("sandbox {} not found", id))
}

async fn cleanup_idle_sandboxes(sandboxes: &Sandboxes, ttl: Duration) {
    let mut sandboxes = sandboxes.write().await;
    let now = Instant::now();

    let expired: Vec<String> = sandboxes
        .iter()
        .filter(|(_, s)| now.duration_since(s.last_used) > ttl)
        .map(|(id, _)| id.clone())
        .collect();

    for id in expired {
        if let Some(sandbox) = sandboxes.remove(&id) {
            info!("Cleaning up idle sandbox: {}", id);
            tokio::task::spawn_blocking(move || {
                sandbox::destroy_sandbox(&sandbox.root);
            });
        }
    }
}
