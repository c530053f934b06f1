//! Per-IP request limiting for the whole API.
//!
//! [`RateLimitLayer`] charges every request to the `global` namespace of the
//! shared [`RateLimiter`], keyed by client IP. Endpoint-specific namespaces
//! (`login`, `otp`, `contact`, `chat`) are checked by their handlers through
//! [`ClientIp`].
//!
//! The client IP is the socket peer address. Only when that peer is listed in
//! `server.trusted_proxies` are the forwarding headers consulted, in order:
//! - the first entry of `X-Forwarded-For`
//! - `X-Real-IP`
//!
//! Without connect info the key is `"unknown"`.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Request},
    http::{request::Parts, Extensions, HeaderMap, Response},
    response::IntoResponse,
};
use td_harness::rate_limiter::RateLimiter;
use tower::{Layer, Service};

use crate::api_error::ApiError;
use crate::http_api::ApiState;

pub const GLOBAL_NAMESPACE: &str = "global";

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    header("x-forwarded-for").or_else(|| header("x-real-ip"))
}

/// Client address for rate limiting, see the module docs for the rules.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return "unknown".to_string();
    };
    if trusted_proxies.contains(&peer) {
        if let Some(forwarded) = forwarded_for(headers) {
            return forwarded;
        }
    }
    peer.to_string()
}

/// Extractor for [`client_ip`], using the proxies trusted by the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<ApiState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(client_ip(
            &parts.headers,
            &parts.extensions,
            &state.config.server.trusted_proxies,
        )))
    }
}

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RateLimitLayer {
    rate_limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl RateLimitLayer {
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            rate_limiter,
            trusted_proxies: Arc::from([]),
        }
    }

    pub fn with_trusted_proxies(mut self, proxies: &[IpAddr]) -> Self {
        self.trusted_proxies = Arc::from(proxies);
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            rate_limiter: self.rate_limiter.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    rate_limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
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
        let rate_limiter = self.rate_limiter.clone();
        let trusted_proxies = self.trusted_proxies.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ip = client_ip(req.headers(), req.extensions(), &trusted_proxies);
            match rate_limiter.check(GLOBAL_NAMESPACE, &ip) {
                Ok(()) => inner.call(req).await,
                Err(err) => Ok(ApiError::from(err).into_response()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use td_harness::rate_limiter::RateLimitRule;
    use tower::ServiceExt;

    const PROXY: [u8; 4] = [10, 0, 0, 2];

    fn test_router(limit: u32) -> Router {
        let limiter = Arc::new(
            RateLimiter::new().with_rule(GLOBAL_NAMESPACE, RateLimitRule::per_minute(limit)),
        );
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(RateLimitLayer::new(limiter).with_trusted_proxies(&[IpAddr::from(PROXY)]))
    }

    fn request(peer: [u8; 4], forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/ping");
        if let Some(ip) = forwarded {
            builder = builder.header("x-forwarded-for", format!("{ip}, 10.0.0.1"));
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
        req
    }

    fn via_proxy(ip: &str) -> Request<Body> {
        request(PROXY, Some(ip))
    }

    #[tokio::test]
    async fn rejects_over_limit_with_retry_after() {
        let app = test_router(2);
        for _ in 0..2 {
            let resp = app.clone().oneshot(via_proxy("203.0.113.7")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = app.oneshot(via_proxy("203.0.113.7")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = resp
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry));
    }

    #[tokio::test]
    async fn clients_behind_proxy_are_limited_separately() {
        let app = test_router(1);
        assert_eq!(app.clone().oneshot(via_proxy("198.51.100.1")).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.clone().oneshot(via_proxy("198.51.100.2")).await.unwrap().status(), StatusCode::OK);
        assert_eq!(
            app.oneshot(via_proxy("198.51.100.1")).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn forged_forwarded_for_from_untrusted_peer_is_ignored() {
        let app = test_router(1);
        let direct = [192, 0, 2, 50];
        let resp = app
            .clone()
            .oneshot(request(direct, Some("198.51.100.10")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        // A fresh header value each time still lands on the peer's bucket.
        let resp = app
            .oneshot(request(direct, Some("198.51.100.11")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn ip_lookup_order() {
        let trusted = [IpAddr::from(PROXY)];
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " 192.0.2.11 , 10.0.0.1".parse().unwrap());
        let mut ext = Extensions::new();
        assert_eq!(client_ip(&headers, &ext, &trusted), "unknown");

        ext.insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 9], 5555))));
        assert_eq!(client_ip(&headers, &ext, &trusted), "192.0.2.9");

        let mut ext = Extensions::new();
        ext.insert(ConnectInfo(SocketAddr::from((PROXY, 5555))));
        assert_eq!(client_ip(&headers, &ext, &trusted), "192.0.2.11");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.0.2.10".parse().unwrap());
        assert_eq!(client_ip(&headers, &ext, &trusted), "192.0.2.10");

        // A trusted proxy that forwards nothing is itself the client.
        assert_eq!(client_ip(&HeaderMap::new(), &ext, &trusted), "10.0.0.2");
    }
}
