// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// One sub-module per resource. This file owns the Axum router and the
// middleware stack; handlers live next to the entities they serve.

mod accounts;
mod articles;
mod contact;
mod jobs;
mod misc;
mod notifications;
mod promo;
pub mod state;
mod trips;
pub mod types;
mod users;

pub use router::api_router;
pub use state::ApiState;

// ---------------------------------------------------------------------------
// Router + middleware
// ---------------------------------------------------------------------------

mod router {
    use super::*;
    use axum::{
        extract::{DefaultBodyLimit, Request},
        http::{header, HeaderValue, Method},
        middleware::{self as axum_middleware, Next},
        response::Response,
        routing::{get, post, put},
        Router,
    };
    use std::sync::Arc;
    use tower_http::cors::{AllowOrigin, CorsLayer};

    use crate::auth::CronAuthLayer;
    use crate::rate_limit_middleware::RateLimitLayer;
    use td_telemetry::middleware::metrics_middleware;
    use td_telemetry::tracing_setup::request_id_middleware;

    /// Response headers every page of the site should carry.
    async fn security_headers_middleware(request: Request, next: Next) -> Response {
        let mut response = next.run(request).await;
        let headers = response.headers_mut();
        headers.insert(
            "X-Content-Type-Options",
            HeaderValue::from_static("nosniff"),
        );
        headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
        headers.insert(
            "Referrer-Policy",
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        response
    }

    /// `http://localhost` or `http://127.0.0.1`, optionally with a port.
    pub(super) fn is_dev_origin(origin: &str) -> bool {
        let Some(rest) = origin
            .strip_prefix("http://localhost")
            .or_else(|| origin.strip_prefix("http://127.0.0.1"))
        else {
            return false;
        };
        match rest.strip_prefix(':') {
            None => rest.is_empty(),
            Some(port) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        }
    }

    fn cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
                    let Ok(origin) = origin.to_str() else {
                        return false;
                    };
                    is_dev_origin(origin) || allowed_origins.iter().any(|allowed| origin == allowed)
                },
            ))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(true)
    }

    /// Build the full API router.
    ///
    /// `/api/cron/*` answers 401 unless the request carries the cron secret
    /// from `state`; without a secret those routes are closed entirely.
    pub fn api_router(state: Arc<ApiState>) -> Router {
        let cron = Router::new()
            .route("/api/cron/complete-trips", post(jobs::complete_trips))
            .route("/api/cron/credit-cashback", post(jobs::credit_cashback))
            .route("/api/cron/expire-promo-codes", post(jobs::expire_promo_codes))
            .route("/api/cron/cleanup", post(jobs::cleanup))
            .layer(CronAuthLayer::new(state.cron_secret.clone()));

        let upload_limit = state.config.storage.max_upload_bytes;
        let body_limit = state.config.server.body_limit_bytes;
        let allowed_origins = state.config.server.allowed_origins.clone();

        Router::new()
            .route("/api/health", get(misc::health))
            .route("/api/widget", get(misc::widget))
            .route("/api/metrics", get(misc::metrics))
            // Auth
            .route("/api/auth/register", post(accounts::register))
            .route("/api/auth/otp", post(accounts::request_otp))
            .route("/api/auth/verify", post(accounts::verify_phone))
            .route("/api/auth/login", post(accounts::login))
            .route("/api/auth/logout", post(accounts::logout))
            .route("/api/auth/password/reset", post(accounts::reset_password))
            .route("/api/auth/me", get(accounts::me).patch(accounts::update_me))
            // Users and ledger
            .route("/api/users", get(users::list_users))
            .route("/api/users/{id}", get(users::get_user))
            .route("/api/users/{id}/privilege", put(users::set_privilege))
            .route("/api/users/{id}/balance", post(users::adjust_balance))
            .route("/api/users/{id}/transactions", get(users::user_transactions))
            .route("/api/cashback/transactions", get(users::my_transactions))
            // Trips
            .route("/api/trips", get(trips::list_trips).post(trips::create_trip))
            .route(
                "/api/trips/{id}",
                get(trips::get_trip)
                    .put(trips::update_trip)
                    .delete(trips::delete_trip),
            )
            .route("/api/trips/{id}/status", post(trips::set_trip_status))
            // Promo codes
            .route(
                "/api/promo-codes",
                get(promo::list_promo_codes).post(promo::create_promo_code),
            )
            .route(
                "/api/promo-codes/{code}",
                get(promo::get_promo_code).delete(promo::cancel_promo_code),
            )
            .route("/api/promo-codes/{code}/redeem", post(promo::redeem_promo_code))
            // Articles: read by slug, edit by id
            .route(
                "/api/articles",
                get(articles::list_articles).post(articles::create_article),
            )
            .route(
                "/api/articles/{article}",
                get(articles::get_article)
                    .put(articles::update_article)
                    .delete(articles::delete_article),
            )
            .route(
                "/api/uploads",
                post(misc::upload).layer(DefaultBodyLimit::max(upload_limit)),
            )
            // Contact requests
            .route(
                "/api/contact",
                get(contact::list_contact_requests).post(contact::submit_contact),
            )
            .route("/api/contact/{id}/handled", post(contact::mark_contact_handled))
            // Notifications
            .route("/api/notifications", get(notifications::list_notifications))
            .route("/api/notifications/count", get(notifications::notification_count))
            .route("/api/notifications/read-all", post(notifications::mark_all_read))
            .route("/api/notifications/{id}/read", post(notifications::mark_read))
            .route(
                "/api/notifications/{id}",
                axum::routing::delete(notifications::delete_notification),
            )
            .route("/api/audit-logs", get(misc::list_audit_logs))
            .route("/api/chat", post(misc::chat))
            .merge(cron)
            .route_layer(axum_middleware::from_fn(metrics_middleware))
            .layer(axum_middleware::from_fn(security_headers_middleware))
            .layer(
                RateLimitLayer::new(state.limiter.clone())
                    .with_trusted_proxies(&state.config.server.trusted_proxies),
            )
            .layer(axum_middleware::from_fn(request_id_middleware))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(cors_layer(allowed_origins))
            .with_state(state)
    }
}
