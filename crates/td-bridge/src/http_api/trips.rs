use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use td_core::store::{TripFilter, TripUpdate};
use td_core::types::{NotificationKind, Privilege, Trip, TripStatus};
use td_core::validation::{normalize_phone, validate_length};

use super::state::ApiState;
use super::types::{CreateTripRequest, TripListQuery, TripStatusRequest};
use crate::api_error::ApiError;
use crate::auth::{Admin, CurrentUser, Manager};
use crate::side_effects::{audit, notify_phone};

fn status_label(status: TripStatus) -> &'static str {
    match status {
        TripStatus::Pending => "pending",
        TripStatus::Confirmed => "confirmed",
        TripStatus::Paid => "paid",
        TripStatus::Completed => "completed",
        TripStatus::Cancelled => "cancelled",
    }
}

fn optional_phone(raw: Option<String>) -> Result<Option<String>, ApiError> {
    match raw.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => Ok(Some(normalize_phone(p)?)),
        _ => Ok(None),
    }
}

async fn load_trip(state: &ApiState, id: Uuid) -> Result<Trip, ApiError> {
    state
        .store
        .get_trip(id)
        .await?
        .ok_or_else(|| ApiError::not_found("trip"))
}

/// GET /api/trips -- clients see their own trips, staff see all.
pub(crate) async fn list_trips(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<TripListQuery>,
) -> Result<Json<Vec<Trip>>, ApiError> {
    let mut filter = TripFilter {
        owner_phone: optional_phone(query.owner_phone)?,
        manager_phone: optional_phone(query.manager_phone)?,
        status: query.status,
        limit: query.limit,
        offset: query.offset,
    };
    if !user.is_at_least(Privilege::Manager) {
        filter.owner_phone = Some(user.phone.clone());
        filter.manager_phone = None;
    }
    Ok(Json(state.store.list_trips(&filter).await?))
}

/// POST /api/trips -- book a trip for a registered client.
pub(crate) async fn create_trip(
    State(state): State<Arc<ApiState>>,
    Manager(manager): Manager,
    Json(req): Json<CreateTripRequest>,
) -> Result<(StatusCode, Json<Trip>), ApiError> {
    let owner_phone = normalize_phone(&req.owner_phone)?;
    if state.store.get_user_by_phone(&owner_phone).await?.is_none() {
        return Err(ApiError::not_found("owner account"));
    }
    validate_length("destination", &req.destination, 1, 200)?;

    let mut trip = Trip::new(
        owner_phone,
        req.destination.trim(),
        req.departure_date,
        req.return_date,
        req.price,
    );
    trip.manager_phone = Some(optional_phone(req.manager_phone)?.unwrap_or(manager.phone));
    trip.hotel = req.hotel.map(|h| h.trim().to_string()).filter(|h| !h.is_empty());
    trip.adults = req.adults.unwrap_or(1);
    trip.children = req.children.unwrap_or(0);
    trip.paid_amount = req.paid_amount.unwrap_or(0);
    trip.cashback_percent = req
        .cashback_percent
        .unwrap_or(state.config.cashback.default_percent);
    trip.notes = req.notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

    state.store.create_trip(&trip).await?;
    info!(trip_id = %trip.id, manager_id = %manager.id, "trip created");
    audit(
        &state.store,
        manager.id,
        "trip.create",
        "trip",
        trip.id,
        json!({ "destination": trip.destination, "price": trip.price }),
    )
    .await;
    notify_phone(
        &state.store,
        &trip.owner_phone,
        NotificationKind::TripUpdate,
        "New trip booked",
        &format!(
            "Your trip to {} from {} has been booked.",
            trip.destination, trip.departure_date
        ),
    )
    .await;
    Ok((StatusCode::CREATED, Json(trip)))
}

/// GET /api/trips/{id} -- 404 for clients who do not own the trip.
pub(crate) async fn get_trip(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Trip>, ApiError> {
    let trip = load_trip(&state, id).await?;
    if !user.is_at_least(Privilege::Manager) && trip.owner_phone != user.phone {
        return Err(ApiError::not_found("trip"));
    }
    Ok(Json(trip))
}

/// PUT /api/trips/{id}
pub(crate) async fn update_trip(
    State(state): State<Arc<ApiState>>,
    Manager(manager): Manager,
    Path(id): Path<Uuid>,
    Json(mut update): Json<TripUpdate>,
) -> Result<Json<Trip>, ApiError> {
    if let Some(phone) = update.manager_phone.take() {
        // Empty clears the manager.
        update.manager_phone = Some(optional_phone(Some(phone))?.unwrap_or_default());
    }
    if let Some(destination) = &update.destination {
        validate_length("destination", destination, 1, 200)?;
    }
    let trip = state.store.update_trip(id, update).await?;
    audit(
        &state.store,
        manager.id,
        "trip.update",
        "trip",
        trip.id,
        json!({
            "destination": trip.destination,
            "price": trip.price,
            "paid_amount": trip.paid_amount,
            "cashback_percent": trip.cashback_percent,
        }),
    )
    .await;
    Ok(Json(trip))
}

/// POST /api/trips/{id}/status -- move the trip along its lifecycle.
pub(crate) async fn set_trip_status(
    State(state): State<Arc<ApiState>>,
    Manager(manager): Manager,
    Path(id): Path<Uuid>,
    Json(req): Json<TripStatusRequest>,
) -> Result<Json<Trip>, ApiError> {
    let before = load_trip(&state, id).await?;
    let trip = state.store.set_trip_status(id, req.status).await?;
    info!(
        trip_id = %trip.id,
        from = status_label(before.status),
        to = status_label(trip.status),
        "trip status changed"
    );
    audit(
        &state.store,
        manager.id,
        "trip.status",
        "trip",
        trip.id,
        json!({ "from": before.status, "to": trip.status }),
    )
    .await;
    notify_phone(
        &state.store,
        &trip.owner_phone,
        NotificationKind::TripUpdate,
        "Trip status updated",
        &format!(
            "Your trip to {} is now {}.",
            trip.destination,
            status_label(trip.status)
        ),
    )
    .await;
    Ok(Json(trip))
}

/// DELETE /api/trips/{id}
pub(crate) async fn delete_trip(
    State(state): State<Arc<ApiState>>,
    Admin(admin): Admin,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_trip(id).await? {
        return Err(ApiError::not_found("trip"));
    }
    audit(&state.store, admin.id, "trip.delete", "trip", id, json!({})).await;
    Ok(StatusCode::NO_CONTENT)
}
