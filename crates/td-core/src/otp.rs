//! One-time SMS codes for phone verification and password reset.
//!
//! Only the HMAC of a code is stored. A code is live until it expires, is
//! consumed, or has been checked `max_attempts` times.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::crypto::{self, CryptoError, OtpKey};
use crate::store::{enum_to_sql, Store, StoreError};
use crate::types::{OtpCode, OtpPurpose};
use crate::validation::mask_phone;

pub const OTP_DIGITS: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("a code was sent recently, retry in {retry_after_secs}s")]
    Cooldown { retry_after_secs: u64 },
    #[error("no active code for this phone")]
    NotFound,
    #[error("code expired")]
    Expired,
    #[error("too many attempts, request a new code")]
    Locked,
    #[error("invalid code, {remaining} attempts left")]
    Invalid { remaining: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy)]
pub struct OtpSettings {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub resend_cooldown: Duration,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(300),
            max_attempts: 5,
            resend_cooldown: Duration::seconds(60),
        }
    }
}

impl From<&AuthConfig> for OtpSettings {
    fn from(auth: &AuthConfig) -> Self {
        Self {
            ttl: Duration::seconds(auth.otp_ttl_secs as i64),
            max_attempts: auth.otp_max_attempts,
            resend_cooldown: Duration::seconds(auth.otp_resend_cooldown_secs as i64),
        }
    }
}

/// A freshly issued code. `code` is the plaintext to deliver by SMS.
#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

pub struct OtpService {
    store: Arc<Store>,
    key: OtpKey,
    settings: OtpSettings,
}

impl OtpService {
    pub fn new(store: Arc<Store>, key: OtpKey, settings: OtpSettings) -> Self {
        Self {
            store,
            key,
            settings,
        }
    }

    pub fn settings(&self) -> &OtpSettings {
        &self.settings
    }

    /// Issue a new code, superseding any earlier one for the same phone and
    /// purpose.
    pub async fn issue(&self, phone: &str, purpose: OtpPurpose) -> Result<IssuedOtp, OtpError> {
        self.issue_at(phone, purpose, Utc::now()).await
    }

    pub async fn issue_at(
        &self,
        phone: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> Result<IssuedOtp, OtpError> {
        if let Some(last) = self.store.last_otp_issued_at(phone, purpose).await? {
            let ready_at = last + self.settings.resend_cooldown;
            if ready_at > now {
                let wait = ((ready_at - now).num_milliseconds() + 999) / 1000;
                return Err(OtpError::Cooldown {
                    retry_after_secs: wait.max(1) as u64,
                });
            }
        }

        let code = crypto::generate_otp(OTP_DIGITS)?;
        let purpose_tag = enum_to_sql(&purpose);
        let otp = OtpCode {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            purpose,
            code_hash: self.key.hash_code(phone, &purpose_tag, &code),
            attempts: 0,
            expires_at: now + self.settings.ttl,
            consumed_at: None,
            created_at: now,
        };
        self.store.insert_otp(&otp).await?;
        info!(phone = %mask_phone(phone), purpose = %purpose_tag, "otp issued");
        Ok(IssuedOtp {
            code,
            expires_at: otp.expires_at,
        })
    }

    /// Check a submitted code and consume it on success.
    pub async fn verify(&self, phone: &str, purpose: OtpPurpose, code: &str) -> Result<(), OtpError> {
        self.verify_at(phone, purpose, code, Utc::now()).await
    }

    pub async fn verify_at(
        &self,
        phone: &str,
        purpose: OtpPurpose,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OtpError> {
        let Some(otp) = self.store.latest_otp(phone, purpose).await? else {
            return Err(OtpError::NotFound);
        };
        if otp.expires_at <= now {
            return Err(OtpError::Expired);
        }
        // Claim the attempt before looking at the code, so concurrent guesses
        // cannot all slip in under the limit.
        let max = self.settings.max_attempts;
        let Some(attempts) = self.store.claim_otp_attempt(otp.id, max).await? else {
            return Err(OtpError::Locked);
        };

        let purpose_tag = enum_to_sql(&purpose);
        if !self
            .key
            .verify_code(phone, &purpose_tag, code.trim(), &otp.code_hash)
        {
            let remaining = max.saturating_sub(attempts);
            debug!(phone = %mask_phone(phone), attempts, "otp mismatch");
            return Err(OtpError::Invalid { remaining });
        }

        if !self.store.consume_otp(otp.id, max, now).await? {
            return Err(OtpError::NotFound);
        }
        info!(phone = %mask_phone(phone), purpose = %purpose_tag, "otp verified");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PHONE: &str = "+79990001122";

    async fn service(settings: OtpSettings) -> OtpService {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        OtpService::new(store, OtpKey::new(b"test-secret".to_vec()), settings)
    }

    #[tokio::test]
    async fn issue_then_verify_consumes_code() {
        let svc = service(OtpSettings::default()).await;
        let issued = svc.issue(PHONE, OtpPurpose::VerifyPhone).await.unwrap();
        assert_eq!(issued.code.len(), 6);

        svc.verify(PHONE, OtpPurpose::VerifyPhone, &issued.code)
            .await
            .unwrap();
        let again = svc.verify(PHONE, OtpPurpose::VerifyPhone, &issued.code).await;
        assert!(matches!(again, Err(OtpError::NotFound)));
    }

    #[tokio::test]
    async fn code_is_bound_to_purpose() {
        let svc = service(OtpSettings::default()).await;
        let issued = svc.issue(PHONE, OtpPurpose::VerifyPhone).await.unwrap();
        let res = svc
            .verify(PHONE, OtpPurpose::ResetPassword, &issued.code)
            .await;
        assert!(matches!(res, Err(OtpError::NotFound)));
    }

    #[tokio::test]
    async fn wrong_guesses_lock_the_code() {
        let settings = OtpSettings {
            max_attempts: 3,
            ..OtpSettings::default()
        };
        let svc = service(settings).await;
        let issued = svc.issue(PHONE, OtpPurpose::VerifyPhone).await.unwrap();
        let wrong = if issued.code == "000000" { "111111" } else { "000000" };

        for expected in [2, 1, 0] {
            match svc.verify(PHONE, OtpPurpose::VerifyPhone, wrong).await {
                Err(OtpError::Invalid { remaining }) => assert_eq!(remaining, expected),
                other => panic!("unexpected: {other:?}"),
            }
        }
        // Even the right code is refused once locked.
        let res = svc.verify(PHONE, OtpPurpose::VerifyPhone, &issued.code).await;
        assert!(matches!(res, Err(OtpError::Locked)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_guesses_respect_the_attempt_limit() {
        let svc = Arc::new(service(OtpSettings::default()).await);
        let issued = svc.issue(PHONE, OtpPurpose::VerifyPhone).await.unwrap();
        let wrong = if issued.code == "000000" { "111111" } else { "000000" };

        let mut handles = Vec::new();
        for _ in 0..50 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.verify(PHONE, OtpPurpose::VerifyPhone, wrong).await
            }));
        }
        let mut checked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(OtpError::Invalid { .. }) => checked += 1,
                Err(OtpError::Locked) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(checked, 5);

        let stored = svc
            .store
            .latest_otp(PHONE, OtpPurpose::VerifyPhone)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attempts, 5);
        let res = svc.verify(PHONE, OtpPurpose::VerifyPhone, &issued.code).await;
        assert!(matches!(res, Err(OtpError::Locked)));
    }

    #[tokio::test]
    async fn locked_code_cannot_be_consumed() {
        let settings = OtpSettings {
            max_attempts: 1,
            ..OtpSettings::default()
        };
        let svc = service(settings).await;
        let issued = svc.issue(PHONE, OtpPurpose::VerifyPhone).await.unwrap();
        let otp = svc
            .store
            .latest_otp(PHONE, OtpPurpose::VerifyPhone)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(svc.store.claim_otp_attempt(otp.id, 1).await.unwrap(), Some(1));
        assert_eq!(svc.store.claim_otp_attempt(otp.id, 1).await.unwrap(), None);
        // Consumption is refused once the spent attempts exceed the limit.
        assert!(!svc.store.consume_otp(otp.id, 0, Utc::now()).await.unwrap());
        assert!(matches!(
            svc.verify(PHONE, OtpPurpose::VerifyPhone, &issued.code).await,
            Err(OtpError::Locked)
        ));
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let svc = service(OtpSettings::default()).await;
        let issued_at = Utc::now() - Duration::seconds(600);
        let issued = svc
            .issue_at(PHONE, OtpPurpose::VerifyPhone, issued_at)
            .await
            .unwrap();
        let res = svc.verify(PHONE, OtpPurpose::VerifyPhone, &issued.code).await;
        assert!(matches!(res, Err(OtpError::Expired)));
    }

    #[tokio::test]
    async fn resend_cooldown_applies() {
        let svc = service(OtpSettings::default()).await;
        let now = Utc::now();
        svc.issue_at(PHONE, OtpPurpose::VerifyPhone, now)
            .await
            .unwrap();
        let res = svc
            .issue_at(PHONE, OtpPurpose::VerifyPhone, now + Duration::seconds(10))
            .await;
        match res {
            Err(OtpError::Cooldown { retry_after_secs }) => assert_eq!(retry_after_secs, 50),
            other => panic!("unexpected: {other:?}"),
        }
        // A different purpose has its own cooldown.
        svc.issue_at(PHONE, OtpPurpose::ResetPassword, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reissue_supersedes_previous_code() {
        let svc = service(OtpSettings {
            resend_cooldown: Duration::zero(),
            ..OtpSettings::default()
        })
        .await;
        let first = svc.issue(PHONE, OtpPurpose::VerifyPhone).await.unwrap();
        let second = svc.issue(PHONE, OtpPurpose::VerifyPhone).await.unwrap();
        if first.code != second.code {
            let res = svc.verify(PHONE, OtpPurpose::VerifyPhone, &first.code).await;
            assert!(matches!(res, Err(OtpError::Invalid { .. })));
        }
        svc.verify(PHONE, OtpPurpose::VerifyPhone, &second.code)
            .await
            .unwrap();
    }
}
