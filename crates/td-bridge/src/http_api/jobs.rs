//! `/api/cron/*` handlers. Authentication is done by `CronAuthLayer` on the
//! sub-router, so these only run the job and report.

use axum::{extract::State, Json};
use std::sync::Arc;

use super::state::ApiState;
use crate::api_error::ApiError;
use crate::cron::{self, CleanupReport, CompleteTripsReport, CreditReport, ExpireReport};

pub(crate) async fn complete_trips(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<CompleteTripsReport>, ApiError> {
    Ok(Json(cron::complete_trips(&state).await?))
}

pub(crate) async fn credit_cashback(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<CreditReport>, ApiError> {
    Ok(Json(cron::credit_cashback(&state).await?))
}

pub(crate) async fn expire_promo_codes(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ExpireReport>, ApiError> {
    Ok(Json(cron::expire_promo_codes(&state).await?))
}

pub(crate) async fn cleanup(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<CleanupReport>, ApiError> {
    Ok(Json(cron::cleanup(&state).await?))
}
