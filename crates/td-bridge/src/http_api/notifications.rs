use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use td_core::store::NotificationCounts;
use td_core::types::Notification;

use super::state::ApiState;
use super::types::NotificationQuery;
use crate::api_error::ApiError;
use crate::auth::CurrentUser;

/// GET /api/notifications -- newest first; `?unread=true` for unread only.
pub(crate) async fn list_notifications(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    Ok(Json(
        state
            .store
            .list_notifications(user.id, query.unread, query.limit, query.offset)
            .await?,
    ))
}

/// GET /api/notifications/count
pub(crate) async fn notification_count(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<NotificationCounts>, ApiError> {
    Ok(Json(state.store.notification_counts(user.id).await?))
}

/// POST /api/notifications/{id}/read
pub(crate) async fn mark_read(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.mark_notification_read(id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/notifications/read-all
pub(crate) async fn mark_all_read(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Value>, ApiError> {
    let marked = state.store.mark_all_notifications_read(user.id).await?;
    Ok(Json(json!({ "marked": marked })))
}

/// DELETE /api/notifications/{id}
pub(crate) async fn delete_notification(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_notification(id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
