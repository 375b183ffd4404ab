//! HTTP server implementation using Axum.

use crate::auth::require_bearer;
use crate::error::AgentError;
use crate::exec::CommandOutput;
use crate::files::{BatchItem, Encoding, FileContent, FileInfo, ListEntry, ListOptions};
use crate::pty::TerminalSize;
use crate::search::{self, SearchHit, SearchQuery};
use crate::state::AppState;
use crate::terminal::{SessionInfo, SHUTDOWN_GRACE};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

/// Floor for the request body limit; raised to fit base64 file payloads.
const MIN_BODY_LIMIT: usize = 2 * 1024 * 1024;

// Request/Response types
#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

type ApiResult<T> = Result<Json<Success<T>>, AgentError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Success {
        success: true,
        data,
    }))
}

#[derive(Serialize)]
struct PathOnly {
    path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    cwd: String,
    platform: &'static str,
    arch: &'static str,
    terminal_sessions: usize,
}

#[derive(Deserialize)]
struct ReadRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    encoding: Encoding,
}

#[derive(Deserialize)]
struct ReadBatchRequest {
    paths: Vec<String>,
}

#[derive(Serialize)]
struct BatchResponse {
    files: Vec<BatchItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest {
    #[serde(default)]
    path: String,
    content: String,
    #[serde(default)]
    encoding: Encoding,
    #[serde(default)]
    create_dirs: bool,
}

#[derive(Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    path: String,
    content: String,
    #[serde(default)]
    encoding: Encoding,
}

#[derive(Serialize)]
struct Written {
    path: String,
    size: u64,
}

#[derive(Deserialize)]
struct DeleteRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Deserialize)]
struct StatRequest {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListRequest {
    path: Option<String>,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    include_content: bool,
}

#[derive(Serialize)]
struct Listing {
    path: String,
    entries: Vec<ListEntry>,
}

#[derive(Deserialize)]
struct MkdirRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Deserialize)]
struct TransferRequest {
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Serialize)]
struct Transferred {
    source: String,
    destination: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    path: Option<String>,
    max_depth: Option<usize>,
    max_results: Option<usize>,
}

#[derive(Serialize)]
struct SearchResults {
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecRequest {
    command: String,
    cwd: Option<String>,
    timeout_ms: Option<u64>,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize)]
struct TerminalQuery {
    cols: Option<u16>,
    rows: Option<u16>,
}

impl TerminalQuery {
    fn size(&self) -> TerminalSize {
        let default = TerminalSize::default();
        TerminalSize {
            cols: self.cols.filter(|c| *c > 0).unwrap_or(default.cols),
            rows: self.rows.filter(|r| *r > 0).unwrap_or(default.rows),
        }
    }
}

#[derive(Serialize)]
struct Sessions {
    sessions: Vec<SessionInfo>,
}

/// Build the router. Everything but `/health` requires the bearer token;
/// `/terminal` checks it itself before accepting the upgrade.
pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_mul(2)
        .max(MIN_BODY_LIMIT);

    let protected = Router::new()
        .route("/files/read", post(read_file))
        .route("/files/read-batch", post(read_batch))
        .route("/files/write", post(write_file))
        .route("/files/update", post(update_file))
        .route("/files/delete", post(delete_file))
        .route("/files/stat", post(stat_file))
        .route("/files/list", post(list_files))
        .route("/files/mkdir", post(make_dir))
        .route("/files/copy", post(copy_file))
        .route("/files/move", post(move_file))
        .route("/search", post(search_files))
        .route("/exec", post(exec))
        .route("/terminal/sessions", get(list_terminals))
        .route("/terminal/sessions/:id", delete(close_terminal))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_bearer,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/terminal", get(terminal))
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn run_server<F>(state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(state.config.addr).await?;
    info!(
        addr = %listener.local_addr()?,
        root = %state.sandbox.root().display(),
        "starting HTTP server"
    );
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener. When `shutdown` resolves, terminal
/// sessions are torn down first, then in-flight requests drain.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let terminals = state.terminals.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown requested");
            let report = terminals.shutdown(SHUTDOWN_GRACE).await;
            info!(
                graceful = report.graceful,
                forced = report.forced,
                "terminal sessions stopped"
            );
        })
        .await
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        cwd: state.sandbox.root().display().to_string(),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        terminal_sessions: state.terminals.len().await,
    })
}

async fn read_file(
    State(state): State<AppState>,
    Json(req): Json<ReadRequest>,
) -> ApiResult<FileContent> {
    ok(state.files.read(&req.path, req.encoding).await?)
}

async fn read_batch(
    State(state): State<AppState>,
    Json(req): Json<ReadBatchRequest>,
) -> ApiResult<BatchResponse> {
    let files = state.files.read_batch(&req.paths).await;
    ok(BatchResponse { files })
}

async fn write_file(
    State(state): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<Written> {
    let size = state
        .files
        .write(&req.path, &req.content, req.encoding, req.create_dirs)
        .await?;
    ok(Written {
        path: req.path,
        size,
    })
}

async fn update_file(
    State(state): State<AppState>,
    Json(req): Json<UpdateRequest>,
) -> ApiResult<Written> {
    let size = state
        .files
        .update(&req.path, &req.content, req.encoding)
        .await?;
    ok(Written {
        path: req.path,
        size,
    })
}

async fn delete_file(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<PathOnly> {
    state.files.delete(&req.path, req.recursive).await?;
    ok(PathOnly { path: req.path })
}

async fn stat_file(
    State(state): State<AppState>,
    Json(req): Json<StatRequest>,
) -> ApiResult<FileInfo> {
    ok(state.files.stat(&req.path).await?)
}

async fn list_files(
    State(state): State<AppState>,
    body: Option<Json<ListRequest>>,
) -> ApiResult<Listing> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let options = ListOptions {
        recursive: req.recursive,
        include_content: req.include_content,
    };
    let entries = state.files.list(req.path.as_deref(), options).await?;
    ok(Listing {
        path: req.path.unwrap_or_else(|| ".".to_string()),
        entries,
    })
}

async fn make_dir(
    State(state): State<AppState>,
    Json(req): Json<MkdirRequest>,
) -> ApiResult<PathOnly> {
    state.files.mkdir(&req.path, req.recursive).await?;
    ok(PathOnly { path: req.path })
}

async fn copy_file(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Transferred> {
    state
        .files
        .copy(&req.source, &req.destination, req.overwrite)
        .await?;
    ok(Transferred {
        source: req.source,
        destination: req.destination,
    })
}

async fn move_file(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Transferred> {
    state
        .files
        .rename(&req.source, &req.destination, req.overwrite)
        .await?;
    ok(Transferred {
        source: req.source,
        destination: req.destination,
    })
}

async fn search_files(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResults> {
    let mut query = SearchQuery::new(req.query);
    query.path = req.path;
    if let Some(depth) = req.max_depth {
        query.max_depth = depth;
    }
    if let Some(limit) = req.max_results {
        query.max_results = limit;
    }
    let results = search::search(&state.sandbox, query).await?;
    ok(SearchResults { results })
}

async fn exec(
    State(state): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<CommandOutput>, AgentError> {
    let timeout = req.timeout_ms.map(Duration::from_millis);
    let output = if req.stream {
        state
            .runner
            .run_streaming(&req.command, req.cwd.as_deref(), timeout, |chunk| {
                debug!(stream = ?chunk.stream, bytes = chunk.data.len(), "command output");
            })
            .await?
    } else {
        state
            .runner
            .run_buffered(&req.command, req.cwd.as_deref(), timeout)
            .await?
    };
    Ok(Json(output))
}

async fn terminal(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Option<Query<TerminalQuery>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Upgrades never pass the bearer middleware, so check before accepting.
    if let Err(err) = state.auth.check(&headers) {
        warn!("rejected unauthenticated terminal upgrade");
        let mut response = err.into_response();
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        return response;
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let size = query.map(|Query(q)| q.size()).unwrap_or_default();
    let terminals = state.terminals.clone();
    ws.on_upgrade(move |socket| async move { terminals.attach(socket, size).await })
}

async fn list_terminals(State(state): State<AppState>) -> ApiResult<Sessions> {
    ok(Sessions {
        sessions: state.terminals.list().await,
    })
}

async fn close_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AgentError> {
    if state.terminals.close(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AgentError::NotFound(format!("terminal session {id} not found")))
    }
}
