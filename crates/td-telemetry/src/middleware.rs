use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};

use crate::metrics::{global_metrics, REQUESTS_TOTAL, REQUEST_DURATION};

/// Records `http_requests_total{method,route,status}` and the request latency
/// histogram.
///
/// The route label is the matched route template (`/api/trips/{id}`), so
/// install this with `Router::route_layer`; unmatched requests are labelled
/// `unmatched`.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let m = global_metrics();
    m.increment_counter(
        REQUESTS_TOTAL,
        &[("method", &method), ("route", &route), ("status", &status)],
    );
    m.observe(REQUEST_DURATION, start.elapsed().as_secs_f64());

    response
}
