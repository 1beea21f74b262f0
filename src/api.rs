// src/api.rs
use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;

use crate::config::ServerCfg;
use crate::housekeeping::{Housekeeper, SweepReport};
use crate::queue::{QueueTask, TaskStatus, WorkQueue};
use crate::ratelimit::LimiterState;
use crate::store::{CatalogStore, ControlStore, LimiterStore, QueueStore, StoreError};
use crate::worker::{IngestWorker, RunSummary};

const DISPATCH_HEADER: &str = "x-dispatch-key";

/// Assemble the full application over the in-memory store and the given
/// vendor client, returning the router the binary serves plus the state
/// the background loops need.
pub fn create_app(
    cfg: &crate::config::AppConfig,
    vendor: Arc<dyn crate::vendor::VendorApi>,
) -> (Router, AppState<crate::store::MemStore>) {
    let store = Arc::new(crate::store::MemStore::new());
    let policy = crate::freshness::FreshnessPolicy::new(cfg.freshness.clone());
    let boost: Arc<dyn crate::freshness::HotBoost> =
        Arc::new(crate::freshness::RuleBoost::from_cfg(&cfg.freshness));
    let worker = Arc::new(IngestWorker::new(
        Arc::clone(&store),
        cfg.queue,
        cfg.limiter,
        cfg.worker.clone(),
        vendor,
        policy,
        boost,
    ));
    let housekeeper = Arc::new(Housekeeper::new(
        Arc::clone(&store),
        cfg.housekeeping,
        cfg.queue,
    ));
    let queue = Arc::new(WorkQueue::new(Arc::clone(&store), cfg.queue));
    let state = AppState {
        store,
        worker,
        housekeeper,
        queue,
        server_cfg: cfg.server.clone(),
    };
    (router(state.clone()), state)
}

pub struct AppState<S> {
    pub store: Arc<S>,
    pub worker: Arc<IngestWorker<S>>,
    pub housekeeper: Arc<Housekeeper<S>>,
    pub queue: Arc<WorkQueue<S>>,
    pub server_cfg: ServerCfg,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            worker: Arc::clone(&self.worker),
            housekeeper: Arc::clone(&self.housekeeper),
            queue: Arc::clone(&self.queue),
            server_cfg: self.server_cfg.clone(),
        }
    }
}

type ApiError = (StatusCode, String);

fn internal(e: StoreError) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub fn router<S>(state: AppState<S>) -> Router
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/run", post(trigger_run))
        .route("/admin/requeue-failed", post(admin_requeue_failed))
        .route("/admin/clear-cooldown", post(admin_clear_cooldown))
        .route("/admin/sweep", post(admin_sweep))
        .route("/debug/queue", get(debug_queue))
        .route("/debug/limiter", get(debug_limiter))
        .route("/debug/cooldown", get(debug_cooldown))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// POST /run: on-demand ingestion trigger. Only the designated internal
/// dispatcher (shared-secret header) or an explicitly enabled manual
/// flag may invoke it; anything else is rejected.
async fn trigger_run<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Json<RunSummary>, ApiError>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    let presented = headers
        .get(DISPATCH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let key_ok = !state.server_cfg.dispatch_key.is_empty()
        && presented == state.server_cfg.dispatch_key;
    if !key_ok && !state.server_cfg.allow_manual_run {
        return Err((StatusCode::FORBIDDEN, "run trigger not authorized".into()));
    }

    let summary = state
        .worker
        .run_once()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(summary))
}

#[derive(serde::Serialize)]
struct RequeueResp {
    requeued: usize,
}

async fn admin_requeue_failed<S>(
    State(state): State<AppState<S>>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<RequeueResp>, ApiError>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    let tenant = q.get("tenant").map(String::as_str);
    let requeued = state
        .queue
        .requeue_failed(tenant, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(RequeueResp { requeued }))
}

async fn admin_clear_cooldown<S>(State(state): State<AppState<S>>) -> Result<String, ApiError>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    state
        .housekeeper
        .clear_global_cooldown()
        .await
        .map_err(internal)?;
    Ok("cleared".to_string())
}

async fn admin_sweep<S>(State(state): State<AppState<S>>) -> Result<Json<SweepReport>, ApiError>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    let report = state
        .housekeeper
        .sweep(Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(report))
}

async fn debug_queue<S>(
    State(state): State<AppState<S>>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Vec<QueueTask>>, ApiError>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    let status = q.get("status").and_then(|s| TaskStatus::parse(s));
    let tenant = q.get("tenant").map(String::as_str);
    let tasks = state.store.list(status, tenant).await.map_err(internal)?;
    Ok(Json(tasks))
}

async fn debug_limiter<S>(
    State(state): State<AppState<S>>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Option<LimiterState>>, ApiError>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    let key = q.get("key").cloned().unwrap_or_default();
    let state_out = state.store.read_limiter(&key).await.map_err(internal)?;
    Ok(Json(state_out))
}

#[derive(serde::Serialize)]
struct CooldownResp {
    until: Option<DateTime<Utc>>,
    active: bool,
}

async fn debug_cooldown<S>(State(state): State<AppState<S>>) -> Result<Json<CooldownResp>, ApiError>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore + Send + Sync + 'static,
{
    let until = state
        .store
        .global_cooldown_until()
        .await
        .map_err(internal)?;
    let active = until.is_some_and(|u| Utc::now() < u);
    Ok(Json(CooldownResp { until, active }))
}
