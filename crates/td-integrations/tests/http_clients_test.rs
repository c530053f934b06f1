//! Drives the HTTP clients against an in-process axum server.

use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{post, put},
    Json, Router,
};
use td_integrations::sms::{HttpSmsClient, SmsError, SmsSender};
use td_integrations::storage::{HttpObjectStorage, StorageError, Uploader};

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(String, Option<String>, Vec<u8>)>>>,
}

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn auth(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[tokio::test]
async fn sms_client_posts_json_with_bearer() {
    let captured = Captured::default();
    let router = Router::new()
        .route(
            "/api/messages",
            post(
                |State(c): State<Captured>, headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    c.requests.lock().unwrap().push((
                        "sms".into(),
                        auth(&headers),
                        serde_json::to_vec(&body).unwrap(),
                    ));
                    StatusCode::ACCEPTED
                },
            ),
        )
        .with_state(captured.clone());
    let base = spawn(router).await;

    let client = HttpSmsClient::new(format!("{base}/api/"), "sms-key", "TourDesk").unwrap();
    client.send("+79991234567", "Your code: 123456").await.unwrap();

    let reqs = captured.requests.lock().unwrap().clone();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].1.as_deref(), Some("Bearer sms-key"));
    let body: serde_json::Value = serde_json::from_slice(&reqs[0].2).unwrap();
    assert_eq!(body["to"], "+79991234567");
    assert_eq!(body["text"], "Your code: 123456");
    assert_eq!(body["sender"], "TourDesk");
}

#[tokio::test]
async fn sms_gateway_errors_surface() {
    let router = Router::new().route(
        "/messages",
        post(|| async { (StatusCode::PAYMENT_REQUIRED, "balance exhausted") }),
    );
    let base = spawn(router).await;
    let client = HttpSmsClient::new(base, "k", "TourDesk").unwrap();
    match client.send("+79991234567", "hi").await {
        Err(SmsError::Api { status, message }) => {
            assert_eq!(status, 402);
            assert_eq!(message, "balance exhausted");
        }
        other => panic!("expected gateway error, got {other:?}"),
    }
}

#[tokio::test]
async fn storage_puts_object_and_returns_public_url() {
    let captured = Captured::default();
    let router = Router::new()
        .route(
            "/{bucket}/{*key}",
            put(
                |State(c): State<Captured>,
                 Path((bucket, key)): Path<(String, String)>,
                 headers: HeaderMap,
                 body: Bytes| async move {
                    c.requests
                        .lock()
                        .unwrap()
                        .push((format!("{bucket}/{key}"), auth(&headers), body.to_vec()));
                    StatusCode::OK
                },
            ),
        )
        .with_state(captured.clone());
    let base = spawn(router).await;

    let storage = HttpObjectStorage::new(&base, "media", "https://cdn.example.com", "tok");
    let uploader = Uploader::new(Arc::new(storage), 1024);
    let stored = uploader.upload("image/webp", b"RIFFxxxxWEBP".to_vec()).await.unwrap();

    assert!(stored.key.starts_with("uploads/"));
    assert!(stored.key.ends_with(".webp"));
    assert_eq!(stored.url, format!("https://cdn.example.com/{}", stored.key));

    let reqs = captured.requests.lock().unwrap().clone();
    assert_eq!(reqs[0].0, format!("media/{}", stored.key));
    assert_eq!(reqs[0].1.as_deref(), Some("Bearer tok"));
    assert_eq!(reqs[0].2, b"RIFFxxxxWEBP".to_vec());
}

#[tokio::test]
async fn storage_rejections_surface() {
    let router = Router::new().route(
        "/{bucket}/{*key}",
        put(|| async { (StatusCode::FORBIDDEN, "denied") }),
    );
    let base = spawn(router).await;
    let uploader = Uploader::new(
        Arc::new(HttpObjectStorage::new(&base, "media", "https://cdn", "bad")),
        1024,
    );
    assert!(matches!(
        uploader.upload("application/pdf", vec![b'%'; 10]).await,
        Err(StorageError::Api { status: 403, .. })
    ));
}
