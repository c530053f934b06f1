use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use td_core::config::WidgetConfig;
use td_core::types::AuditLog;
use td_integrations::storage::StoredObject;
use td_intelligence::ChatReply;
use td_telemetry::metrics::global_metrics;

use super::state::ApiState;
use super::types::{AuditLogQuery, ChatRequest, HealthResponse, IntegrationStatus};
use crate::api_error::ApiError;
use crate::auth::{Admin, Manager};
use crate::rate_limit_middleware::ClientIp;
use crate::side_effects::audit;

// ---------------------------------------------------------------------------
// Health and widget
// ---------------------------------------------------------------------------

/// GET /api/health -- liveness plus a few counters for dashboards.
pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        metrics: global_metrics().snapshot(),
        integrations: IntegrationStatus {
            sms: state.sms.is_some(),
            storage: state.uploader.is_some(),
            ai: state.assistant.is_some(),
            cron: state.cron_secret.is_some(),
        },
    })
}

/// GET /api/widget -- settings for the embedded tour-search widget.
pub(crate) async fn widget(State(state): State<Arc<ApiState>>) -> Json<WidgetConfig> {
    Json(state.config.widget.clone())
}

/// GET /api/metrics -- request counters in Prometheus text format.
pub(crate) async fn metrics(Admin(_): Admin) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        global_metrics().render_prometheus(),
    )
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// GET /api/audit-logs -- newest first, optionally for one entity type.
pub(crate) async fn list_audit_logs(
    State(state): State<Arc<ApiState>>,
    Admin(_): Admin,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<Vec<AuditLog>>, ApiError> {
    let entity = query.entity.filter(|e| !e.trim().is_empty());
    Ok(Json(
        state
            .store
            .list_audit_logs(entity, query.limit, query.offset)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// POST /api/chat -- one assistant turn. The browser keeps the history.
pub(crate) async fn chat(
    State(state): State<Arc<ApiState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    state.limiter.check("chat", &ip)?;
    let assistant = state
        .assistant
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("chat assistant is not configured".into()))?;
    Ok(Json(assistant.reply(&req.history, &req.message).await?))
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

/// POST /api/uploads -- raw request body to object storage. The media type
/// comes from `Content-Type`.
pub(crate) async fn upload(
    State(state): State<Arc<ApiState>>,
    Manager(manager): Manager,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StoredObject>), ApiError> {
    let uploader = state
        .uploader
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("object storage is not configured".into()))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let stored = uploader.upload(&content_type, body.to_vec()).await?;
    info!(key = %stored.key, size = stored.size, user_id = %manager.id, "file uploaded");
    audit(
        &state.store,
        manager.id,
        "upload.create",
        "upload",
        &stored.key,
        json!({ "content_type": stored.content_type, "size": stored.size }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(stored)))
}
