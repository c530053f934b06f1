use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use td_core::config::StorageConfig;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported content type `{0}`")]
    UnsupportedType(String),

    #[error("upload is {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("upload is empty")]
    Empty,

    #[error("object storage is not configured: {0}")]
    NotConfigured(String),

    #[error("storage error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Accepted upload types and the extension their keys get.
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
    ("image/gif", "gif"),
    ("application/pdf", "pdf"),
];

/// Extension for an allow-listed content type. Parameters such as
/// `; charset=...` are ignored.
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ALLOWED_TYPES
        .iter()
        .find(|(ct, _)| *ct == essence)
        .map(|(_, ext)| *ext)
}

/// `uploads/<yyyy>/<mm>/<uuid>.<ext>`
pub fn object_key(content_type: &str, now: DateTime<Utc>) -> Result<String, StorageError> {
    let ext = extension_for(content_type)
        .ok_or_else(|| StorageError::UnsupportedType(content_type.to_string()))?;
    Ok(format!(
        "uploads/{:04}/{:02}/{}.{ext}",
        now.year(),
        now.month(),
        Uuid::new_v4().as_simple()
    ))
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `key` and return the public URL.
    async fn put(&self, key: &str, content_type: &str, bytes: Vec<u8>)
        -> Result<String, StorageError>;
}

/// Result of a successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
    pub content_type: String,
    pub size: usize,
}

/// Validates uploads and hands them to the configured backend.
#[derive(Clone)]
pub struct Uploader {
    storage: Arc<dyn ObjectStorage>,
    max_bytes: usize,
}

impl Uploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, max_bytes: usize) -> Self {
        Self { storage, max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn upload(
        &self,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, StorageError> {
        if bytes.is_empty() {
            return Err(StorageError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(StorageError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }
        let key = object_key(content_type, Utc::now())?;
        let size = bytes.len();
        let url = self.storage.put(&key, content_type, bytes).await?;
        info!(key = %key, size, "upload stored");
        Ok(StoredObject {
            key,
            url,
            content_type: content_type.to_string(),
            size,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// S3-style bucket behind a bearer token: `PUT {endpoint}/{bucket}/{key}`.
pub struct HttpObjectStorage {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    public_base_url: String,
    token: String,
}

impl HttpObjectStorage {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Requires `endpoint` in config. The public base URL defaults to
    /// `{endpoint}/{bucket}`.
    pub fn from_config(config: &StorageConfig, token: impl Into<String>) -> Result<Self, StorageError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| StorageError::NotConfigured("storage.endpoint is not set".into()))?;
        let public = config
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket));
        Ok(Self::new(endpoint, &config.bucket, public, token))
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StorageError> {
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), key, "object storage rejected upload");
            return Err(StorageError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// Keeps objects in memory and serves them from a fake base URL.
#[derive(Debug)]
pub struct MockStorage {
    base_url: String,
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl MockStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Content type and bytes stored under `key`.
    pub fn get(&self, key: &str) -> Option<(String, Vec<u8>)> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new("https://cdn.test")
    }
}

#[async_trait]
impl ObjectStorage for MockStorage {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StorageError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (content_type.to_string(), bytes));
        Ok(format!("{}/{key}", self.base_url))
    }
}
