use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::Utc;

use herald_core::{Delivery, DeliveryStats};

use crate::middleware::RequestId;

use super::jobs::LimitQuery;
use super::{map_db_error, normalize_limit, ApiError, ApiResponse, AppState, ResponseMeta};

pub(super) async fn delivery_stats(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> Result<Json<ApiResponse<DeliveryStats>>, ApiError> {
    let data = state
        .store
        .delivery_stats(Utc::now())
        .await
        .map_err(|e| map_db_error(req_id.0.clone(), &e))?;

    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}

pub(super) async fn list_failed_deliveries(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiResponse<Vec<Delivery>>>, ApiError> {
    let data = state
        .store
        .list_failed_deliveries(normalize_limit(query.limit))
        .await
        .map_err(|e| map_db_error(req_id.0.clone(), &e))?;

    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}
