//! Axum JSON API for triggering syncs and reading the catalog.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gcr_storage::CatalogStore;
use gcr_sync::{
    maybe_build_scheduler, NoopProgress, ProgressStore, RunStatus, SyncConfig, SyncError, SyncJobs,
    SyncMode, SyncPipeline, MAX_PAGE_SIZE,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcr-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub jobs: SyncJobs,
    pub default_limit: u32,
    pub full_mode: SyncMode,
}

impl AppState {
    /// Starts the job workers, so it must run inside a tokio runtime.
    pub fn new(pipeline: Arc<SyncPipeline>, config: &SyncConfig) -> Self {
        let jobs = SyncJobs::start(
            pipeline.clone(),
            ProgressStore::new(config.progress_ttl),
            config.worker_count,
            config.job_policy,
        );
        Self {
            pipeline,
            jobs,
            default_limit: config.default_limit,
            full_mode: config.full_catalog(),
        }
    }

    fn store(&self) -> &CatalogStore {
        self.pipeline.store()
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn resolve(&self, default_limit: u32) -> Result<u32, Response> {
        match self.limit {
            None => Ok(default_limit),
            Some(n) if (1..=i64::from(MAX_PAGE_SIZE)).contains(&n) => Ok(n as u32),
            Some(n) => Err(unprocessable(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {n}"
            ))),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync/run", post(sync_run_handler))
        .route("/sync/games", post(sync_enqueue_handler))
        .route("/sync/games/all", post(sync_enqueue_all_handler))
        .route("/sync/status/{task_id}", get(sync_status_handler))
        .route("/sync/last", get(sync_last_handler))
        .route("/games", get(games_handler))
        .route("/games/{id}", get(game_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port: u16 = std::env::var("GCR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let store = CatalogStore::connect(&config.database_url).await?;
    let pipeline = Arc::new(SyncPipeline::new(&config, store)?);
    let state = AppState::new(pipeline, &config);

    // held for the lifetime of the server
    let scheduler = maybe_build_scheduler(&config, state.jobs.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn sync_run_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = match query.resolve(state.default_limit) {
        Ok(limit) => limit,
        Err(resp) => return resp,
    };
    match state
        .pipeline
        .run(SyncMode::SinglePage { limit }, &NoopProgress)
        .await
    {
        Ok(audit) => Json(audit).into_response(),
        Err(failure) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": failure.message })),
        )
            .into_response(),
    }
}

async fn sync_enqueue_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match query.resolve(state.default_limit) {
        Ok(limit) => enqueue(&state, SyncMode::SinglePage { limit }).await,
        Err(resp) => resp,
    }
}

async fn sync_enqueue_all_handler(State(state): State<Arc<AppState>>) -> Response {
    enqueue(&state, state.full_mode).await
}

async fn enqueue(state: &AppState, mode: SyncMode) -> Response {
    match state.jobs.submit(mode).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "task_id": task_id,
                "status": "queued",
                "message": format!("Sync task queued: {mode}"),
            })),
        )
            .into_response(),
        Err(err @ SyncError::InvalidPageSize(_)) => unprocessable(err.to_string()),
        Err(err @ SyncError::QueueClosed) => error_json(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        Err(err) => server_error(err.into()),
    }
}

/// Always 200. Ids that are not UUIDs can never match a run and poll as queued.
async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    match Uuid::parse_str(&task_id) {
        Ok(run_id) => Json(state.jobs.status(run_id).await).into_response(),
        Err(_) => match serde_json::to_value(RunStatus::queued(Uuid::nil())) {
            Ok(mut body) => {
                body["task_id"] = json!(task_id);
                Json(body).into_response()
            }
            Err(err) => server_error(err.into()),
        },
    }
}

async fn sync_last_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store().last_audit(gcr_core::SYNC_SOURCE).await {
        Ok(audit) => Json(audit).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn games_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store().list_items().await {
        Ok(items) => Json(items).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn game_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.store().get_item(id).await {
        Ok(Some(item)) => Json(item).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, format!("game {id} not found")),
        Err(err) => server_error(err.into()),
    }
}

fn unprocessable(message: String) -> Response {
    error_json(StatusCode::UNPROCESSABLE_ENTITY, message)
}

fn error_json(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}
