use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use td_core::config::SmsConfig;
use td_core::validation::mask_phone;
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SmsError {
    /// The gateway answered with a non-success status.
    #[error("SMS gateway error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("missing SMS API key")]
    MissingApiKey,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Deliver `text` to `to` (normalised `+<digits>` phone).
    async fn send(&self, to: &str, text: &str) -> Result<(), SmsError>;
}

// ---------------------------------------------------------------------------
// HTTP gateway client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    text: &'a str,
    sender: &'a str,
}

/// Client for a JSON SMS gateway: `POST {base_url}/messages` with a bearer
/// key and a `{to, text, sender}` body.
pub struct HttpSmsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    sender: String,
}

impl HttpSmsClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        sender: impl Into<String>,
    ) -> Result<Self, SmsError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SmsError::MissingApiKey);
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            sender: sender.into(),
        })
    }

    pub fn from_config(config: &SmsConfig, api_key: impl Into<String>) -> Result<Self, SmsError> {
        Self::new(&config.base_url, api_key, &config.sender)
    }
}

#[async_trait]
impl SmsSender for HttpSmsClient {
    async fn send(&self, to: &str, text: &str) -> Result<(), SmsError> {
        let url = format!("{}/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&SendRequest {
                to,
                text,
                sender: &self.sender,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), to = %mask_phone(to), "SMS gateway rejected message");
            return Err(SmsError::Api {
                status: status.as_u16(),
                message,
            });
        }
        debug!(to = %mask_phone(to), "SMS sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSms {
    pub to: String,
    pub text: String,
}

/// Records every message instead of sending it. Used in tests and when no
/// gateway key is configured in development.
#[derive(Debug, Default)]
pub struct MockSms {
    sent: Mutex<Vec<SentSms>>,
    fail: bool,
}

impl MockSms {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose every send fails with a 503 gateway error.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentSms> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Text of the most recent message delivered to `to`.
    pub fn last_to(&self, to: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.to == to)
            .map(|m| m.text)
    }
}

#[async_trait]
impl SmsSender for MockSms {
    async fn send(&self, to: &str, text: &str) -> Result<(), SmsError> {
        if self.fail {
            return Err(SmsError::Api {
                status: 503,
                message: "mock gateway unavailable".into(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentSms {
                to: to.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            HttpSmsClient::new("http://localhost", "  ", "TourDesk"),
            Err(SmsError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn mock_records_in_order() {
        let sms = MockSms::new();
        sms.send("+79990000001", "first").await.unwrap();
        sms.send("+79990000002", "other").await.unwrap();
        sms.send("+79990000001", "second").await.unwrap();
        assert_eq!(sms.sent().len(), 3);
        assert_eq!(sms.last_to("+79990000001").as_deref(), Some("second"));
        assert_eq!(sms.last_to("+70000000000"), None);
    }

    #[tokio::test]
    async fn failing_mock_errors() {
        let sms = MockSms::failing();
        assert!(sms.send("+79990000001", "x").await.is_err());
        assert!(sms.sent().is_empty());
    }
}
