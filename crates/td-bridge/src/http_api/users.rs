use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use td_core::store::{LedgerEntry, UserFilter};
use td_core::types::{CashbackTransaction, Notification, NotificationKind, TransactionKind, User};

use super::state::ApiState;
use super::types::{BalanceAdjustmentRequest, PageQuery, SetPrivilegeRequest, UserListQuery};
use crate::api_error::ApiError;
use crate::auth::{Admin, CurrentUser, Manager};
use crate::side_effects::{audit, money, notify};

async fn load_user(state: &ApiState, id: Uuid) -> Result<User, ApiError> {
    state
        .store
        .get_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("user"))
}

/// GET /api/users -- search accounts by phone or name.
pub(crate) async fn list_users(
    State(state): State<Arc<ApiState>>,
    Manager(_): Manager,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let filter = UserFilter {
        search: query.search.filter(|s| !s.trim().is_empty()),
        min_privilege: query.min_privilege,
        limit: query.limit,
        offset: query.offset,
    };
    Ok(Json(state.store.list_users(&filter).await?))
}

/// GET /api/users/{id}
pub(crate) async fn get_user(
    State(state): State<Arc<ApiState>>,
    Manager(_): Manager,
    Path(id): Path<Uuid>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(load_user(&state, id).await?))
}

/// PUT /api/users/{id}/privilege -- admins cannot change their own tier.
pub(crate) async fn set_privilege(
    State(state): State<Arc<ApiState>>,
    Admin(admin): Admin,
    Path(id): Path<Uuid>,
    Json(req): Json<SetPrivilegeRequest>,
) -> Result<Json<User>, ApiError> {
    if id == admin.id {
        return Err(ApiError::Forbidden(
            "cannot change your own privilege".into(),
        ));
    }
    let before = load_user(&state, id).await?;
    state.store.set_privilege(id, req.privilege).await?;
    audit(
        &state.store,
        admin.id,
        "user.privilege",
        "user",
        id,
        json!({ "from": before.privilege, "to": req.privilege }),
    )
    .await;
    info!(user_id = %id, privilege = ?req.privilege, "privilege changed");
    Ok(Json(load_user(&state, id).await?))
}

/// POST /api/users/{id}/balance -- post a manual ledger correction.
pub(crate) async fn adjust_balance(
    State(state): State<Arc<ApiState>>,
    Admin(admin): Admin,
    Path(id): Path<Uuid>,
    Json(req): Json<BalanceAdjustmentRequest>,
) -> Result<Json<CashbackTransaction>, ApiError> {
    if req.amount == 0 {
        return Err(ApiError::BadRequest("amount must not be zero".into()));
    }
    let reason = req
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if let Some(reason) = &reason {
        td_core::validation::validate_length("reason", reason, 1, 500)?;
    }

    let tx = state
        .store
        .adjust_balance(LedgerEntry::new(id, req.amount, TransactionKind::ManualAdjustment))
        .await?;
    audit(
        &state.store,
        admin.id,
        "user.balance",
        "user",
        id,
        json!({ "amount": req.amount, "balance_after": tx.balance_after, "reason": reason }),
    )
    .await;
    let message = match &reason {
        Some(r) => format!("Balance changed by {}: {r}", money(tx.amount)),
        None => format!("Balance changed by {}", money(tx.amount)),
    };
    notify(
        &state.store,
        Notification::new(id, NotificationKind::Cashback, "Cashback balance updated", message),
    )
    .await;
    Ok(Json(tx))
}

/// GET /api/users/{id}/transactions
pub(crate) async fn user_transactions(
    State(state): State<Arc<ApiState>>,
    Manager(_): Manager,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<CashbackTransaction>>, ApiError> {
    load_user(&state, id).await?;
    Ok(Json(
        state
            .store
            .list_transactions(id, page.limit, page.offset)
            .await?,
    ))
}

/// GET /api/cashback/transactions -- the caller's own ledger.
pub(crate) async fn my_transactions(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<CashbackTransaction>>, ApiError> {
    Ok(Json(
        state
            .store
            .list_transactions(user.id, page.limit, page.offset)
            .await?,
    ))
}
