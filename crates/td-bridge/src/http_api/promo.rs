use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use td_core::types::{Notification, NotificationKind, Privilege, PromoCode};

use super::state::ApiState;
use super::types::{CreatePromoRequest, PromoListQuery, RedeemPromoRequest, RedeemPromoResponse};
use crate::api_error::ApiError;
use crate::auth::{CurrentUser, Manager};
use crate::side_effects::{audit, money, notify};

/// GET /api/promo-codes -- own codes; staff may list everyone's or filter by
/// `owner_id`.
pub(crate) async fn list_promo_codes(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<PromoListQuery>,
) -> Result<Json<Vec<PromoCode>>, ApiError> {
    let owner = if user.is_at_least(Privilege::Manager) {
        query.owner_id
    } else {
        Some(user.id)
    };
    Ok(Json(
        state
            .store
            .list_promo_codes(owner, query.limit, query.offset)
            .await?,
    ))
}

/// POST /api/promo-codes -- reserve part of the caller's cashback balance
/// as a shareable code.
pub(crate) async fn create_promo_code(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreatePromoRequest>,
) -> Result<(StatusCode, Json<PromoCode>), ApiError> {
    let cashback = &state.config.cashback;
    let ttl = Duration::days(cashback.promo_code_ttl_days as i64);
    let promo = state
        .store
        .create_promo_code(user.id, req.amount, cashback.min_promo_amount, ttl)
        .await?;
    info!(promo_id = %promo.id, user_id = %user.id, amount = promo.amount, "promo code issued");
    Ok((StatusCode::CREATED, Json(promo)))
}

/// GET /api/promo-codes/{code}
pub(crate) async fn get_promo_code(
    State(state): State<Arc<ApiState>>,
    Manager(_): Manager,
    Path(code): Path<String>,
) -> Result<Json<PromoCode>, ApiError> {
    state
        .store
        .get_promo_code(&code)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("promo code"))
}

/// POST /api/promo-codes/{code}/redeem -- apply a code, debiting its owner.
pub(crate) async fn redeem_promo_code(
    State(state): State<Arc<ApiState>>,
    Manager(manager): Manager,
    Path(code): Path<String>,
    body: Bytes,
) -> Result<Json<RedeemPromoResponse>, ApiError> {
    // The body is optional: an empty request redeems without a trip.
    let req: RedeemPromoRequest = if body.is_empty() {
        RedeemPromoRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    if let Some(trip_id) = req.trip_id {
        if state.store.get_trip(trip_id).await?.is_none() {
            return Err(ApiError::not_found("trip"));
        }
    }

    let (promo, tx) = state
        .store
        .redeem_promo_code(&code, manager.id, req.trip_id, Utc::now())
        .await?;
    info!(promo_id = %promo.id, manager_id = %manager.id, amount = promo.amount, "promo code redeemed");
    audit(
        &state.store,
        manager.id,
        "promo.redeem",
        "promo_code",
        promo.id,
        json!({ "code": promo.code, "amount": promo.amount, "trip_id": req.trip_id }),
    )
    .await;
    notify(
        &state.store,
        Notification::new(
            promo.owner_id,
            NotificationKind::Promo,
            "Promo code used",
            format!(
                "Your code {} was redeemed for {}.",
                promo.code,
                money(promo.amount)
            ),
        ),
    )
    .await;
    Ok(Json(RedeemPromoResponse {
        promo_code: promo,
        transaction: tx,
    }))
}

/// DELETE /api/promo-codes/{code} -- owners cancel their active codes.
pub(crate) async fn cancel_promo_code(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Path(code): Path<String>,
) -> Result<Json<PromoCode>, ApiError> {
    let promo = state
        .store
        .get_promo_code(&code)
        .await?
        .filter(|p| p.owner_id == user.id)
        .ok_or_else(|| ApiError::not_found("promo code"))?;
    let cancelled = state.store.cancel_promo_code(promo.id).await?;
    info!(promo_id = %promo.id, user_id = %user.id, "promo code cancelled");
    Ok(Json(cancelled))
}
