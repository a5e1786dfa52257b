use axum::extract::{Path, Query, State};
use axum::{
    Extension, Json, Router,
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use syllabus_domain::analytics::AnalyticsWithRecommendations;
use syllabus_domain::dlq::{
    BulkRetryResult, DEFAULT_PAGE_LIMIT, DEFAULT_PURGE_DAYS, DlqJobType, DlqPage, DlqQuery,
    DlqSortBy, DlqStats, SortOrder,
};
use syllabus_domain::jobs::{EntityUpdate, OrphanedCascade};
use syllabus_domain::orchestrator::{BulkCascadeStarted, CascadeProgress, CascadeStarted};
use syllabus_domain::queue::{
    CancelResult, CleanupResult, FailedJobs, QueueHealth, QueueMetrics, ReconcileReport,
    RetentionStats,
};
use syllabus_domain::status_change::StatusChangeResult;
use validator::Validate;

use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let cascades = Router::new()
        .route("/v1/cascades", post(start_cascade))
        .route("/v1/cascades/bulk", post(start_bulk_cascade))
        .route("/v1/cascades/:batch_id/progress", get(get_progress))
        .route("/v1/cascades/:batch_id", delete(cancel_cascade))
        .route(
            "/v1/entities/:entity_type/:entity_id/status",
            post(change_entity_status),
        );

    let admin = Router::new()
        .route("/v1/admin/queues/metrics", get(queue_metrics))
        .route("/v1/admin/queues/health", get(queue_health))
        .route("/v1/admin/queues/retention", get(retention_stats))
        .route("/v1/admin/queues/failed", get(failed_jobs))
        .route("/v1/admin/queues/analytics", get(analytics))
        .route("/v1/admin/queues/cleanup/completed", post(cleanup_completed))
        .route("/v1/admin/queues/cleanup/failed", post(cleanup_failed))
        .route(
            "/v1/admin/queues/:queue/jobs/:job_id/retry",
            post(retry_failed_job),
        )
        .route("/v1/admin/dlq", get(list_dead_letters).delete(purge_dead_letters))
        .route("/v1/admin/dlq/stats", get(dead_letter_stats))
        .route("/v1/admin/dlq/bulk-retry", post(bulk_retry_dead_letters))
        .route("/v1/admin/dlq/:id/retry", post(retry_dead_letter))
        .route("/v1/admin/orphans", get(list_orphans))
        .route("/v1/admin/orphans/reconcile", post(reconcile_orphans));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(cascades)
        .merge(admin)
        .layer(middleware::from_fn(app_middleware::track_http_metrics))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

async fn metrics() -> String {
    observability::render_metrics().unwrap_or_default()
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct StartCascadeRequest {
    #[validate(length(min = 1, max = 32))]
    entity_type: String,
    #[validate(length(min = 1, max = 128))]
    entity_id: String,
    #[validate(length(min = 1, max = 32))]
    new_status: String,
    #[validate(length(min = 1, max = 128))]
    user_id: String,
}

impl StartCascadeRequest {
    fn to_update(&self) -> Result<EntityUpdate, ApiError> {
        Ok(EntityUpdate::new(
            validation::entity_type(&self.entity_type)?,
            validation::entity_id(&self.entity_id)?,
            validation::status(&self.new_status)?,
        ))
    }
}

async fn start_cascade(
    State(state): State<AppState>,
    Json(payload): Json<StartCascadeRequest>,
) -> Result<(StatusCode, Json<CascadeStarted>), ApiError> {
    validation::validate(&payload)?;
    let update = payload.to_update()?;
    let started = state
        .orchestrator
        .start_cascade(
            update.entity_type,
            &update.entity_id,
            update.new_status,
            &payload.user_id,
        )
        .await?;
    observability::register_cascade_started(started.approach.as_str());
    app_middleware::record_batch_id(&started.batch_id);
    Ok((StatusCode::ACCEPTED, Json(started)))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct BulkUpdateItem {
    #[validate(length(min = 1, max = 32))]
    entity_type: String,
    #[validate(length(min = 1, max = 128))]
    entity_id: String,
    #[validate(length(min = 1, max = 32))]
    new_status: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct BulkCascadeRequest {
    #[validate(length(min = 1, max = 500), nested)]
    updates: Vec<BulkUpdateItem>,
    #[validate(length(min = 1, max = 128))]
    user_id: String,
}

async fn start_bulk_cascade(
    State(state): State<AppState>,
    Json(payload): Json<BulkCascadeRequest>,
) -> Result<(StatusCode, Json<BulkCascadeStarted>), ApiError> {
    validation::validate(&payload)?;
    let updates = payload
        .updates
        .iter()
        .map(|item| {
            Ok(EntityUpdate::new(
                validation::entity_type(&item.entity_type)?,
                validation::entity_id(&item.entity_id)?,
                validation::status(&item.new_status)?,
            ))
        })
        .collect::<Result<Vec<_>, ApiError>>()?;
    let started = state
        .orchestrator
        .start_bulk_cascade(updates, &payload.user_id)
        .await?;
    observability::register_cascade_started("batch");
    app_middleware::record_batch_id(&started.batch_id);
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<CascadeProgress>, ApiError> {
    app_middleware::record_batch_id(&batch_id);
    Ok(Json(state.orchestrator.get_progress(&batch_id).await?))
}

async fn cancel_cascade(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<CancelResult>, ApiError> {
    app_middleware::record_batch_id(&batch_id);
    Ok(Json(state.orchestrator.cancel_cascade(&batch_id).await?))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ChangeStatusRequest {
    #[validate(length(min = 1, max = 32))]
    status: String,
    #[validate(length(min = 1, max = 128))]
    user_id: String,
}

async fn change_entity_status(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Extension(correlation): Extension<app_middleware::CorrelationId>,
    Json(payload): Json<ChangeStatusRequest>,
) -> Result<Json<StatusChangeResult>, ApiError> {
    validation::validate(&payload)?;
    let kind = validation::entity_type(&entity_type)?;
    let entity_id = validation::entity_id(&entity_id)?;
    let status = validation::status(&payload.status)?;
    let result = state
        .status_changes
        .change_status(kind, &entity_id, status, &payload.user_id)
        .await?;
    if let Some(started) = &result.cascade {
        observability::register_cascade_started(started.approach.as_str());
        app_middleware::record_batch_id(&started.batch_id);
    }
    tracing::info!(
        correlation_id = %correlation.0,
        entity_type = %kind,
        entity_id = %entity_id,
        status = %status,
        cascaded = result.cascade.is_some(),
        "entity status changed"
    );
    Ok(Json(result))
}

async fn queue_metrics(State(state): State<AppState>) -> Result<Json<QueueMetrics>, ApiError> {
    Ok(Json(state.orchestrator.get_queue_metrics().await?))
}

async fn queue_health(State(state): State<AppState>) -> Result<Json<QueueHealth>, ApiError> {
    Ok(Json(state.runtime.queue.health().await?))
}

async fn retention_stats(State(state): State<AppState>) -> Result<Json<RetentionStats>, ApiError> {
    Ok(Json(state.runtime.queue.retention_stats().await?))
}

async fn failed_jobs(State(state): State<AppState>) -> Result<Json<FailedJobs>, ApiError> {
    Ok(Json(state.runtime.queue.list_failed_jobs().await?))
}

async fn analytics(
    State(state): State<AppState>,
) -> Result<Json<AnalyticsWithRecommendations>, ApiError> {
    Ok(Json(state.analytics.get_with_recommendations().await?))
}

#[derive(Debug, Deserialize, Validate)]
struct HoursQuery {
    #[validate(range(min = 0, max = 8760))]
    hours: Option<u64>,
}

#[derive(Debug, Deserialize, Validate)]
struct DaysQuery {
    #[validate(range(min = 0, max = 3650))]
    days: Option<u64>,
}

async fn cleanup_completed(
    State(state): State<AppState>,
    Query(query): Query<HoursQuery>,
) -> Result<Json<CleanupResult>, ApiError> {
    validation::validate(&query)?;
    let hours = query.hours.unwrap_or(state.config.completed_retention_hours);
    Ok(Json(state.runtime.queue.cleanup_completed_jobs(hours).await?))
}

async fn cleanup_failed(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> Result<Json<CleanupResult>, ApiError> {
    validation::validate(&query)?;
    let days = query.days.unwrap_or(state.config.failed_retention_days);
    Ok(Json(state.runtime.queue.cleanup_failed_jobs(days).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetriedJob {
    job_id: String,
}

async fn retry_failed_job(
    State(state): State<AppState>,
    Path((queue, job_id)): Path<(String, String)>,
) -> Result<Json<RetriedJob>, ApiError> {
    let queue = validation::queue(&queue)?;
    let job_id = state.runtime.queue.retry_failed_job(queue, &job_id).await?;
    Ok(Json(RetriedJob { job_id }))
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct DlqListQuery {
    job_type: Option<DlqJobType>,
    sort_by: Option<DlqSortBy>,
    order: Option<SortOrder>,
    offset: Option<usize>,
    #[validate(range(min = 1, max = 1000))]
    limit: Option<usize>,
}

impl DlqListQuery {
    fn into_query(self) -> DlqQuery {
        DlqQuery {
            job_type: self.job_type.unwrap_or_default(),
            sort_by: self.sort_by.unwrap_or_default(),
            order: self.order.unwrap_or_default(),
            offset: self.offset.unwrap_or(0),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DlqListQuery>,
) -> Result<Json<DlqPage>, ApiError> {
    validation::validate(&query)?;
    Ok(Json(state.dead_letters.list(query.into_query()).await?))
}

async fn dead_letter_stats(State(state): State<AppState>) -> Result<Json<DlqStats>, ApiError> {
    Ok(Json(state.dead_letters.stats().await?))
}

async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetriedJob>, ApiError> {
    let job_id = state.dead_letters.retry(&id).await?;
    Ok(Json(RetriedJob { job_id }))
}

#[derive(Debug, Deserialize, Validate)]
struct BulkRetryRequest {
    #[validate(length(min = 1, max = 500))]
    ids: Vec<String>,
}

async fn bulk_retry_dead_letters(
    State(state): State<AppState>,
    Json(payload): Json<BulkRetryRequest>,
) -> Result<Json<BulkRetryResult>, ApiError> {
    validation::validate(&payload)?;
    Ok(Json(state.dead_letters.bulk_retry(&payload.ids).await?))
}

#[derive(Serialize)]
struct PurgeResponse {
    purged: u64,
}

async fn purge_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> Result<Json<PurgeResponse>, ApiError> {
    validation::validate(&query)?;
    let days = query.days.unwrap_or(DEFAULT_PURGE_DAYS);
    let purged = state.dead_letters.purge_older_than(days).await?;
    Ok(Json(PurgeResponse { purged }))
}

async fn list_orphans(
    State(state): State<AppState>,
) -> Result<Json<Vec<OrphanedCascade>>, ApiError> {
    Ok(Json(state.runtime.queue.list_orphans().await?))
}

async fn reconcile_orphans(
    State(state): State<AppState>,
) -> Result<Json<ReconcileReport>, ApiError> {
    Ok(Json(state.runtime.queue.reconcile_orphans().await?))
}
