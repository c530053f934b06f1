use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use td_telemetry::metrics::{global_metrics, MetricsCollector, REQUESTS_TOTAL};
use td_telemetry::middleware::metrics_middleware;
use td_telemetry::tracing_setup::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
use tower::ServiceExt;

fn app() -> Router {
    Router::new()
        .route(
            "/echo",
            get(|axum::Extension(id): axum::Extension<RequestId>| async move { id.0 }),
        )
        .route("/items/{id}", get(|| async { "item" }))
        .route(
            "/boom",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

#[tokio::test]
async fn request_id_is_generated_and_echoed() {
    let resp = app()
        .oneshot(Request::get("/echo").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let header = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap().to_string();
    assert_eq!(header.len(), 32);

    let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(std::str::from_utf8(&body).unwrap(), header);
}

#[tokio::test]
async fn incoming_request_id_is_reused() {
    let resp = app()
        .oneshot(
            Request::get("/echo")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.headers().get(REQUEST_ID_HEADER).unwrap(), "abc-123");
}

#[tokio::test]
async fn malformed_request_id_is_replaced() {
    let resp = app()
        .oneshot(
            Request::get("/echo")
                .header("x-request-id", "has spaces & symbols")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let header = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
    assert_eq!(header.len(), 32);
}

#[tokio::test]
async fn metrics_use_route_templates() {
    let before = global_metrics().get_counter(
        REQUESTS_TOTAL,
        &[("method", "GET"), ("route", "/items/{id}"), ("status", "200")],
    );
    for id in ["1", "2", "3"] {
        app()
            .oneshot(Request::get(format!("/items/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
    }
    let after = global_metrics().get_counter(
        REQUESTS_TOTAL,
        &[("method", "GET"), ("route", "/items/{id}"), ("status", "200")],
    );
    assert_eq!(after - before, 3);

    app()
        .oneshot(Request::get("/boom").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(global_metrics().snapshot().server_errors_total >= 1);
}

#[test]
fn snapshot_and_prometheus_output() {
    let m = MetricsCollector::new();
    m.increment_counter(REQUESTS_TOTAL, &[("route", "/a"), ("status", "200")]);
    m.increment_counter(REQUESTS_TOTAL, &[("route", "/a"), ("status", "503")]);
    m.observe("http_request_duration_seconds", 0.010);
    m.observe("http_request_duration_seconds", 0.030);

    let snap = m.snapshot();
    assert_eq!(snap.requests_total, 2);
    assert_eq!(snap.server_errors_total, 1);
    assert!((snap.mean_latency_ms - 20.0).abs() < 0.01);

    let text = m.render_prometheus();
    assert!(text.contains("# TYPE http_requests_total counter"));
    assert!(text.contains("http_requests_total{route=\"/a\",status=\"503\"} 1"));
    assert!(text.contains("http_request_duration_seconds_count 2"));
    assert!(text.contains("http_request_duration_seconds_bucket{le=\"+Inf\"} 2"));

    let json = serde_json::to_value(snap).unwrap();
    assert_eq!(json["requests_total"], 2);
}
