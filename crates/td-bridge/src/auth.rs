//! Session cookies, user extractors and cron authentication.
//!
//! A login stores the SHA-256 of a random token in `sessions` and hands the
//! token to the browser as the `td_session` cookie. Extractors resolve the
//! cookie back into a [`User`] on every request and enforce privilege.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderValue, Request, Response, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use subtle::ConstantTimeEq;
use td_core::crypto::hash_token;
use td_core::types::{Privilege, User};
use tower::{Layer, Service};
use tracing::warn;

use crate::api_error::ApiError;
use crate::http_api::ApiState;

pub const SESSION_COOKIE: &str = "td_session";

// ---------------------------------------------------------------------------
// Cookies
// ---------------------------------------------------------------------------

/// `Set-Cookie` value for a fresh session.
pub fn session_cookie(token: &str, max_age_secs: u64, secure: bool) -> Result<HeaderValue, ApiError> {
    let mut cookie =
        format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).map_err(|e| ApiError::InternalError(e.to_string()))
}

/// `Set-Cookie` value that removes the session cookie.
pub fn clear_session_cookie(secure: bool) -> HeaderValue {
    if secure {
        HeaderValue::from_static("td_session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; Secure")
    } else {
        HeaderValue::from_static("td_session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
    }
}

/// Value of cookie `name` across every `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

async fn resolve_user(parts: &Parts, state: &ApiState) -> Result<Option<User>, ApiError> {
    let Some(token) = cookie_value(&parts.headers, SESSION_COOKIE) else {
        return Ok(None);
    };
    Ok(state
        .store
        .resolve_session(&hash_token(&token), Utc::now())
        .await?)
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// The signed-in user. Rejects with 401 when the cookie is missing, unknown
/// or expired.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl FromRequestParts<Arc<ApiState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        resolve_user(parts, state)
            .await?
            .map(CurrentUser)
            .ok_or_else(|| ApiError::Unauthorized("sign in required".into()))
    }
}

/// The signed-in user if there is one. Used by public endpoints that show
/// more to staff.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<User>);

impl FromRequestParts<Arc<ApiState>> for MaybeUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(resolve_user(parts, state).await?))
    }
}

/// 403 unless `user` holds at least `privilege`.
pub fn require_privilege(user: &User, privilege: Privilege) -> Result<(), ApiError> {
    if user.is_at_least(privilege) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "{} privilege required",
            match privilege {
                Privilege::Client => "client",
                Privilege::Manager => "manager",
                Privilege::Admin => "admin",
            }
        )))
    }
}

/// A signed-in manager or admin.
#[derive(Debug, Clone)]
pub struct Manager(pub User);

impl FromRequestParts<Arc<ApiState>> for Manager {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        require_privilege(&user, Privilege::Manager)?;
        Ok(Manager(user))
    }
}

/// A signed-in admin.
#[derive(Debug, Clone)]
pub struct Admin(pub User);

impl FromRequestParts<Arc<ApiState>> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        require_privilege(&user, Privilege::Admin)?;
        Ok(Admin(user))
    }
}

// ---------------------------------------------------------------------------
// CronAuthLayer
// ---------------------------------------------------------------------------

/// Requires `Authorization: Bearer <secret>` on every request. Without a
/// configured secret every request is refused.
#[derive(Clone)]
pub struct CronAuthLayer {
    secret: Option<Arc<String>>,
}

impl CronAuthLayer {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(Arc::new),
        }
    }
}

impl<S> Layer<S> for CronAuthLayer {
    type Service = CronAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CronAuthMiddleware {
            inner,
            secret: self.secret.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CronAuthMiddleware<S> {
    inner: S,
    secret: Option<Arc<String>>,
}

impl<S> Service<Request<Body>> for CronAuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let secret = self.secret.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let provided = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim);

            let authorized = match (&secret, provided) {
                (Some(expected), Some(token)) => {
                    bool::from(token.as_bytes().ct_eq(expected.as_bytes()))
                }
                _ => false,
            };
            if authorized {
                return inner.call(req).await;
            }

            if secret.is_none() {
                warn!(path = %req.uri().path(), "cron request refused: no cron secret configured");
            } else {
                warn!(path = %req.uri().path(), "cron request with missing or wrong secret");
            }
            Ok((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({ "error": "unauthorized" })),
            )
                .into_response())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    fn cron_router(secret: Option<String>) -> Router {
        Router::new()
            .route("/run", post(|| async { "ran" }))
            .layer(CronAuthLayer::new(secret))
    }

    fn post_with(auth: Option<&str>) -> Request<Body> {
        let mut b = Request::builder().method("POST").uri("/run");
        if let Some(a) = auth {
            b = b.header("Authorization", a);
        }
        b.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn unset_secret_refuses_everything() {
        let resp = cron_router(None).oneshot(post_with(Some("Bearer "))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = cron_router(Some(String::new()))
            .oneshot(post_with(Some("Bearer ")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_bearer_passes() {
        let resp = cron_router(Some("s3cret".into()))
            .oneshot(post_with(Some("Bearer s3cret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_or_missing_bearer_fails() {
        for auth in [None, Some("Bearer nope"), Some("s3cret"), Some("Bearer s3cre")] {
            let resp = cron_router(Some("s3cret".into()))
                .oneshot(post_with(auth))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{auth:?}");
        }
    }

    #[test]
    fn cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; td_session=abc123"));
        assert_eq!(cookie_value(&headers, SESSION_COOKIE).as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&headers, "missing"), None);

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, HeaderValue::from_static("td_session="));
        assert_eq!(cookie_value(&empty, SESSION_COOKIE), None);
    }

    #[test]
    fn cookie_attributes() {
        let c = session_cookie("tok", 3600, true).unwrap();
        let s = c.to_str().unwrap();
        assert!(s.starts_with("td_session=tok;"));
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("SameSite=Lax"));
        assert!(s.contains("Max-Age=3600"));
        assert!(s.ends_with("; Secure"));
        assert!(!session_cookie("tok", 1, false).unwrap().to_str().unwrap().contains("Secure"));
        assert!(clear_session_cookie(false).to_str().unwrap().contains("Max-Age=0"));
    }
}
