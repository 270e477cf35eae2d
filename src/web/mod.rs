// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! JSON control API for front ends
//!
//! Runs, progress streaming (Server-Sent Events), history and undo, and
//! credential management. Secrets are accepted but never returned.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post, put},
    Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::CacheStats;
use crate::config::{AppConfig, ClassifierPreference};
use crate::history::BatchInfo;
use crate::reorganize::UndoReport;
use crate::run::{Engine, RunRequest, RunSummary};
use crate::TidyfoldError;

/// Shared application state
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Cancellation switch of each run in progress, by run id
    runs: Mutex<HashMap<u64, ActiveRun>>,
    next_run: AtomicU64,
}

struct ActiveRun {
    root: PathBuf,
    cancel: watch::Sender<bool>,
}

/// Unregisters a run's cancellation switch when the run ends
struct RunTicket {
    state: Arc<AppState>,
    id: u64,
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.state.lock_runs().remove(&self.id);
    }
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
            runs: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
        }
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ActiveRun>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn start_run(self: &Arc<Self>, root: &std::path::Path) -> (RunTicket, watch::Receiver<bool>) {
        let (cancel, rx) = watch::channel(false);
        let id = self.next_run.fetch_add(1, Ordering::SeqCst);
        self.lock_runs().insert(
            id,
            ActiveRun {
                root: root.to_path_buf(),
                cancel,
            },
        );
        (
            RunTicket {
                state: Arc::clone(self),
                id,
            },
            rx,
        )
    }

    /// Cancel runs on `root`, or every run; returns how many were signalled
    pub fn cancel_runs(&self, root: Option<&std::path::Path>) -> usize {
        let runs = self.lock_runs();
        let mut cancelled = 0;
        for run in runs.values() {
            if root.map_or(true, |r| r == run.root) {
                run.cancel.send_replace(true);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of runs still in progress
    pub fn active_runs(&self) -> usize {
        self.lock_runs().len()
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/config", get(api_config))
        .route("/api/runs", post(api_run))
        .route("/api/runs/stream", post(api_run_stream))
        .route("/api/runs/cancel", post(api_cancel))
        .route("/api/history", get(api_history))
        .route("/api/history/:batch/undo", post(api_undo))
        .route(
            "/api/credentials",
            put(api_set_credential)
                .get(api_credential_status)
                .delete(api_delete_credential),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body: `{"error": "...", "kind": "..."}`
pub struct ApiError(TidyfoldError);

impl From<TidyfoldError> for ApiError {
    fn from(err: TidyfoldError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl From<&TidyfoldError> for ErrorBody {
    fn from(err: &TidyfoldError) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TidyfoldError::Config(_) | TidyfoldError::InvalidRoot { .. } => StatusCode::BAD_REQUEST,
            TidyfoldError::BatchNotFound(_) => StatusCode::NOT_FOUND,
            TidyfoldError::CredentialMissing(_) => StatusCode::PRECONDITION_FAILED,
            TidyfoldError::RunInProgress(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// === Status & config ===

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    categories: Vec<String>,
    preference: ClassifierPreference,
    local_model: String,
    remote_enabled: bool,
    remote_credential: bool,
    cache: CacheStats,
    batches: usize,
}

async fn api_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let engine = &state.engine;
    let config = engine.config();
    let remote = &config.classifier.remote;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        categories: config.categories.clone(),
        preference: config.classifier.preference,
        local_model: config.classifier.local.model.clone(),
        remote_enabled: remote.enabled,
        remote_credential: engine.credentials().has(&remote.service_name),
        cache: engine.cache().stats(),
        batches: engine.history().batches()?.len(),
    }))
}

async fn api_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json(state.engine.config().clone())
}

// === Runs ===

async fn api_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> ApiResult<Json<RunSummary>> {
    info!("Run requested for {:?} (dry run: {})", request.root, request.dry_run);
    let (_ticket, cancel) = state.start_run(&request.root);
    let summary = state.engine.run(request, cancel, None).await?;
    Ok(Json(summary))
}

/// Progress events as they happen, then one `summary` (or `error`) event
async fn api_run_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let engine = state.engine.clone();
    let (ticket, cancel) = state.start_run(&request.root);
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let _ticket = ticket;
        engine.run(request, cancel, Some(tx)).await
    });

    let events = stream::unfold((rx, Some(handle)), |(mut rx, handle)| async move {
        if let Some(progress) = rx.recv().await {
            let event = Event::default()
                .event("progress")
                .json_data(&progress)
                .unwrap_or_else(|_| Event::default().event("progress"));
            return Some((Ok(event), (rx, handle)));
        }

        // Channel closed: the run is over
        let handle = handle?;
        let event = match handle.await {
            Ok(Ok(summary)) => Event::default().event("summary").json_data(&summary),
            Ok(Err(e)) => Event::default().event("error").json_data(ErrorBody::from(&e)),
            Err(e) => Event::default()
                .event("error")
                .json_data(serde_json::json!({ "error": e.to_string(), "kind": "internal" })),
        }
        .unwrap_or_else(|_| Event::default().event("error"));
        Some((Ok(event), (rx, None)))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct CancelQuery {
    root: Option<PathBuf>,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: usize,
}

/// Cancel the runs on `?root=...`, or all runs
async fn api_cancel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CancelQuery>,
) -> (StatusCode, Json<CancelResponse>) {
    let cancelled = state.cancel_runs(query.root.as_deref());
    info!("Cancellation requested for {} run(s)", cancelled);
    (StatusCode::ACCEPTED, Json(CancelResponse { cancelled }))
}

// === History ===

async fn api_history(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<BatchInfo>>> {
    Ok(Json(state.engine.history().batches()?))
}

#[derive(Deserialize)]
struct UndoQuery {
    #[serde(default)]
    dry_run: bool,
}

async fn api_undo(
    State(state): State<Arc<AppState>>,
    Path(batch): Path<String>,
    Query(query): Query<UndoQuery>,
) -> ApiResult<Json<UndoReport>> {
    Ok(Json(state.engine.undo(Some(&batch), query.dry_run)?))
}

// === Credentials ===

#[derive(Deserialize)]
struct SetCredential {
    service: Option<String>,
    secret: String,
}

#[derive(Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

#[derive(Serialize)]
struct CredentialStatus {
    service: String,
    present: bool,
}

fn service_or_default(state: &AppState, service: Option<String>) -> String {
    service.unwrap_or_else(|| state.engine.config().classifier.remote.service_name.clone())
}

async fn api_set_credential(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetCredential>,
) -> ApiResult<StatusCode> {
    let service = service_or_default(&state, body.service);
    state.engine.credentials().set(&service, &body.secret)?;
    info!("Credential stored for {}", service);
    Ok(StatusCode::NO_CONTENT)
}

async fn api_credential_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServiceQuery>,
) -> Json<CredentialStatus> {
    let service = service_or_default(&state, query.service);
    let present = state.engine.credentials().has(&service);
    Json(CredentialStatus { service, present })
}

async fn api_delete_credential(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult<StatusCode> {
    let service = service_or_default(&state, query.service);
    state.engine.credentials().delete(&service)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start the web server
pub async fn start_server(
    engine: Engine,
    mut shutdown: watch::Receiver<bool>,
) -> crate::Result<()> {
    let addr = format!("{}:{}", engine.config().web.host, engine.config().web.port);
    let state = Arc::new(AppState::new(engine));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Control API listening on http://{}", addr);

    let router = create_router(state.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            // Stop dispatching files in any run still going
            state.cancel_runs(None);
        })
        .await
        .map_err(|e| TidyfoldError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
