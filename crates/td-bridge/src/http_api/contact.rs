use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use td_core::store::ContactFilter;
use td_core::types::{ContactRequest, NotificationKind};
use td_core::validation::{mask_phone, normalize_phone, validate_length};
use td_harness::security::InputSanitizer;

use super::state::ApiState;
use super::types::{ContactListQuery, ContactSubmission};
use crate::api_error::ApiError;
use crate::auth::Manager;
use crate::rate_limit_middleware::ClientIp;
use crate::side_effects::{audit, notify_staff, send_sms};

const MAX_MESSAGE_CHARS: usize = 5_000;

/// POST /api/contact -- a visitor asks to be called back.
pub(crate) async fn submit_contact(
    State(state): State<Arc<ApiState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<ContactSubmission>,
) -> Result<(StatusCode, Json<ContactRequest>), ApiError> {
    state.limiter.check("contact", &ip)?;
    validate_length("name", &req.name, 1, 100)?;
    let phone = normalize_phone(&req.phone)?;
    let message = InputSanitizer::new(MAX_MESSAGE_CHARS).sanitize(&req.message)?;
    if message.is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }

    let request = ContactRequest {
        id: Uuid::new_v4(),
        name: req.name.trim().to_string(),
        phone,
        message,
        preferred_date: req.preferred_date,
        handled: false,
        handled_by: None,
        created_at: Utc::now(),
    };
    state.store.create_contact_request(&request).await?;
    info!(contact_id = %request.id, phone = %mask_phone(&request.phone), "contact request received");

    let summary = format!("{} ({}) asked to be contacted.", request.name, request.phone);
    notify_staff(&state.store, NotificationKind::Contact, "New contact request", &summary).await;
    if let Some(admin_phone) = state.config.sms.admin_phone.as_deref() {
        send_sms(state.sms.as_ref(), admin_phone, &format!("tourdesk: {summary}")).await;
    }
    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /api/contact
pub(crate) async fn list_contact_requests(
    State(state): State<Arc<ApiState>>,
    Manager(_): Manager,
    Query(query): Query<ContactListQuery>,
) -> Result<Json<Vec<ContactRequest>>, ApiError> {
    let filter = ContactFilter {
        handled: query.handled,
        limit: query.limit,
        offset: query.offset,
    };
    Ok(Json(state.store.list_contact_requests(&filter).await?))
}

/// POST /api/contact/{id}/handled
pub(crate) async fn mark_contact_handled(
    State(state): State<Arc<ApiState>>,
    Manager(manager): Manager,
    Path(id): Path<Uuid>,
) -> Result<Json<ContactRequest>, ApiError> {
    let request = state.store.mark_contact_handled(id, manager.id).await?;
    audit(&state.store, manager.id, "contact.handled", "contact_request", id, json!({})).await;
    Ok(Json(request))
}
