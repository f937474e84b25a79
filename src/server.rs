//! HTTP surface for the index engine.
//!
//! JSON over `/api/v1`; dates transport as epoch milliseconds, granularity
//! as `"DAY" | "MONTH" | "YEAR"`. The admin reindex routes exist only when
//! persistence is enabled.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    engine::IndexEngine,
    error::{IndexError, Result},
    kv::{KvStore, MemoryKvStore},
    reindex::{ReindexService, ReindexStatus},
    repository::{IndexRepository, PostgresRepository},
    time::{self, Granularity},
    validation,
};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<IndexEngine>,
    reindex: Option<Arc<ReindexService>>,
}

/// Builds the stores from configuration and serves until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let repository: Option<Arc<dyn IndexRepository>> = if config.persistence.enabled {
        let connection = config.connection_string()?;
        Some(Arc::new(PostgresRepository::connect(
            connection,
            &config.persistence.schema,
        )?))
    } else {
        None
    };
    run_with_stores(config, kv, repository).await
}

/// Serves on the configured port with caller-provided stores.
pub async fn run_with_stores(
    config: Config,
    kv: Arc<dyn KvStore>,
    repository: Option<Arc<dyn IndexRepository>>,
) -> Result<()> {
    let engine = IndexEngine::new(kv, repository.clone(), config.engine_options());
    let reindex = repository.map(|repository| {
        Arc::new(ReindexService::new(
            Arc::clone(&engine),
            repository,
            config.persistence.batch_size,
        ))
    });

    let state = AppState {
        engine: Arc::clone(&engine),
        reindex,
    };
    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("starting e4s-index server on {addr}");
    let listener = TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    engine.close();
    result.map_err(|err| IndexError::Kv(err.to_string()))?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/index", post(create_index).get(list_indexes))
        .route("/api/v1/index/exists", post(exists))
        .route("/api/v1/index/prev", post(find_prev))
        .route("/api/v1/index/next", post(find_next))
        .route("/api/v1/index/mark", post(mark))
        .route("/api/v1/index/{name}", get(get_index).delete(delete_index))
        .route("/api/v1/index/{name}/entity/{entity_id}", delete(evict_entity))
        .route("/api/v1/index/{name}/cache", delete(evict_index))
        .route("/api/v1/admin/index/{name}/reindex", post(reindex_full))
        .route(
            "/api/v1/admin/index/{name}/reindex/partition",
            post(reindex_partition),
        )
        .route(
            "/api/v1/admin/index/{name}/reindex/status",
            get(reindex_status),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIndexRequest {
    index_name: String,
}

async fn create_index(
    State(state): State<AppState>,
    Json(request): Json<CreateIndexRequest>,
) -> Result<()> {
    validation::ensure_index_name(&request.index_name)?;
    state.engine.create_index(&request.index_name)
}

async fn list_indexes(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.engine.list_indexes()?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexInfo {
    name: String,
    entity_count: u64,
    cache_size: usize,
    memory_usage_bytes: u64,
}

async fn get_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<IndexInfo>> {
    if !state.engine.index_exists(&name)? {
        return Err(IndexError::NotFound);
    }
    let stats = state.engine.stats(&name)?;
    Ok(Json(IndexInfo {
        name,
        entity_count: stats.entity_count,
        cache_size: stats.cache_size,
        memory_usage_bytes: stats.memory_usage_bytes,
    }))
}

async fn delete_index(State(state): State<AppState>, Path(name): Path<String>) -> Result<()> {
    validation::ensure_index_name(&name)?;
    state.engine.delete_index(&name)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    index_name: String,
    entity_id: i64,
    granularity: Granularity,
    timestamp: i64,
}

impl QueryRequest {
    fn validate(&self) -> Result<u32> {
        validation::ensure_index_name(&self.index_name)?;
        validation::ensure_timestamp(self.timestamp)?;
        Ok(time::to_epoch_value(self.timestamp, self.granularity))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExistsResponse {
    index_name: String,
    entity_id: i64,
    granularity: Granularity,
    timestamp: i64,
    exists: bool,
}

async fn exists(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<ExistsResponse>> {
    let value = request.validate()?;
    let exists = state.engine.exists(
        &request.index_name,
        request.entity_id,
        request.granularity,
        value,
    )?;
    Ok(Json(ExistsResponse {
        index_name: request.index_name,
        entity_id: request.entity_id,
        granularity: request.granularity,
        timestamp: request.timestamp,
        exists,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NavigationResponse {
    index_name: String,
    entity_id: i64,
    granularity: Granularity,
    timestamp: i64,
    result: Option<i64>,
}

async fn find_prev(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<NavigationResponse>> {
    let value = request.validate()?;
    let result = state.engine.find_prev(
        &request.index_name,
        request.entity_id,
        request.granularity,
        value,
    )?;
    Ok(Json(navigation_response(request, result)))
}

async fn find_next(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<NavigationResponse>> {
    let value = request.validate()?;
    let result = state.engine.find_next(
        &request.index_name,
        request.entity_id,
        request.granularity,
        value,
    )?;
    Ok(Json(navigation_response(request, result)))
}

fn navigation_response(request: QueryRequest, result: Option<u32>) -> NavigationResponse {
    NavigationResponse {
        result: result.map(|value| time::epoch_value_to_millis(value, request.granularity)),
        index_name: request.index_name,
        entity_id: request.entity_id,
        granularity: request.granularity,
        timestamp: request.timestamp,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkRequest {
    index_name: String,
    entity_id: i64,
    granularity: Granularity,
    timestamps: Vec<i64>,
}

async fn mark(State(state): State<AppState>, Json(request): Json<MarkRequest>) -> Result<()> {
    validation::ensure_index_name(&request.index_name)?;
    validation::ensure_timestamps(&request.timestamps)?;
    let values: Vec<u32> = request
        .timestamps
        .iter()
        .map(|&millis| time::to_epoch_value(millis, request.granularity))
        .collect();
    state.engine.mark_batch(
        &request.index_name,
        request.entity_id,
        request.granularity,
        &values,
    )
}

async fn evict_entity(
    State(state): State<AppState>,
    Path((name, entity_id)): Path<(String, i64)>,
) -> Result<()> {
    state.engine.evict_entity(&name, entity_id)
}

async fn evict_index(State(state): State<AppState>, Path(name): Path<String>) -> Result<()> {
    state.engine.evict_index(&name)
}

fn reindex_service(state: &AppState) -> Result<Arc<ReindexService>> {
    state.reindex.clone().ok_or(IndexError::NotFound)
}

async fn reindex_full(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ReindexStatus>> {
    validation::ensure_index_name(&name)?;
    let service = reindex_service(&state)?;
    let status = tokio::task::spawn_blocking(move || service.reindex_full(&name))
        .await
        .map_err(|err| IndexError::ReindexFailed(err.to_string()))?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct ReindexPartitionQuery {
    partition: u32,
    granularity: Granularity,
}

async fn reindex_partition(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ReindexPartitionQuery>,
) -> Result<Json<ReindexStatus>> {
    validation::ensure_index_name(&name)?;
    let service = reindex_service(&state)?;
    let status = tokio::task::spawn_blocking(move || {
        service.reindex_partition(&name, query.partition, query.granularity)
    })
    .await
    .map_err(|err| IndexError::ReindexFailed(err.to_string()))?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct ReindexStatusQuery {
    partition: Option<u32>,
    granularity: Option<Granularity>,
}

async fn reindex_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ReindexStatusQuery>,
) -> Result<Json<ReindexStatus>> {
    let service = reindex_service(&state)?;
    let status = match (query.granularity, query.partition) {
        (Some(granularity), Some(partition)) => {
            service.partition_status(&name, granularity, partition)
        }
        _ => service.status(&name),
    };
    Ok(Json(status))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
