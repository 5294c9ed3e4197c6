use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use herald_core::{GenerationJob, JobStats, NewGenerationJob};
use herald_db::EnqueueOutcome;

use crate::middleware::RequestId;

use super::{map_db_error, normalize_limit, ApiError, ApiResponse, AppState, ResponseMeta};

#[derive(Debug, Deserialize)]
pub(super) struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateJobBody {
    pub recipient_id: Uuid,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct AbortJobBody {
    pub reason: String,
}

pub(super) async fn job_stats(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> Result<Json<ApiResponse<JobStats>>, ApiError> {
    let data = state
        .store
        .job_stats()
        .await
        .map_err(|e| map_db_error(req_id.0.clone(), &e))?;

    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}

pub(super) async fn list_failed_jobs(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiResponse<Vec<GenerationJob>>>, ApiError> {
    let data = state
        .store
        .list_failed_jobs(normalize_limit(query.limit))
        .await
        .map_err(|e| map_db_error(req_id.0.clone(), &e))?;

    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}

pub(super) async fn get_job(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ApiResponse<GenerationJob>>, ApiError> {
    let job = state
        .store
        .get_job(job_id)
        .await
        .map_err(|e| map_db_error(req_id.0.clone(), &e))?;

    let Some(data) = job else {
        return Err(ApiError::new(req_id.0, "not_found", "job not found"));
    };

    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}

/// Manually enqueues a job outside any scheduling period.
pub(super) async fn create_job(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Json(body): Json<CreateJobBody>,
) -> Result<(StatusCode, Json<ApiResponse<GenerationJob>>), ApiError> {
    let new_job = NewGenerationJob::manual(
        body.recipient_id,
        body.spec,
        state.job_max_retries,
        body.immediate,
    );

    let outcome = state
        .store
        .create_job(new_job, Utc::now())
        .await
        .map_err(|e| map_db_error(req_id.0.clone(), &e))?;

    match outcome {
        EnqueueOutcome::Created(job) => {
            tracing::info!(
                job_id = %job.id,
                recipient_id = %job.recipient_id,
                immediate = job.immediate_delivery,
                "api: enqueued manual job"
            );
            Ok((
                StatusCode::CREATED,
                Json(ApiResponse {
                    data: job,
                    meta: ResponseMeta::new(req_id.0),
                }),
            ))
        }
        EnqueueOutcome::AlreadyActive(existing) | EnqueueOutcome::AlreadyScheduled(existing) => {
            Err(ApiError::new(
                req_id.0,
                "conflict",
                format!("recipient already has active job {existing}"),
            ))
        }
    }
}

pub(super) async fn abort_job(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<AbortJobBody>,
) -> Result<Json<ApiResponse<GenerationJob>>, ApiError> {
    let reason = body.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::new(
            req_id.0,
            "validation_error",
            "reason must not be empty",
        ));
    }

    let data = state
        .store
        .abort_job(job_id, reason, Utc::now())
        .await
        .map_err(|e| map_db_error(req_id.0.clone(), &e))?;

    tracing::warn!(job_id = %job_id, reason, "api: job aborted by operator");
    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}
