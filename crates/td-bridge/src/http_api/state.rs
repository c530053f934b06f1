use std::sync::Arc;
use std::time::Instant;

use td_core::config::Config;
use td_core::crypto::OtpKey;
use td_core::otp::{OtpService, OtpSettings};
use td_core::store::Store;
use td_harness::rate_limiter::RateLimiter;
use td_integrations::sms::SmsSender;
use td_integrations::storage::Uploader;
use td_intelligence::TravelAssistant;

/// Shared state behind every handler.
///
/// Integrations are optional: an unset SMS gateway skips delivery with a
/// warning, while uploads and chat answer 503 when their backend is missing.
pub struct ApiState {
    pub config: Config,
    pub store: Arc<Store>,
    pub otp: OtpService,
    pub limiter: Arc<RateLimiter>,
    pub sms: Option<Arc<dyn SmsSender>>,
    pub uploader: Option<Uploader>,
    pub assistant: Option<TravelAssistant>,
    /// Bearer secret for `/api/cron/*`.
    pub cron_secret: Option<String>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(config: Config, store: Arc<Store>, otp_key: OtpKey) -> Self {
        let otp = OtpService::new(store.clone(), otp_key, OtpSettings::from(&config.auth));
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limits));
        Self {
            config,
            store,
            otp,
            limiter,
            sms: None,
            uploader: None,
            assistant: None,
            cron_secret: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_sms(mut self, sms: Arc<dyn SmsSender>) -> Self {
        self.sms = Some(sms);
        self
    }

    pub fn with_uploader(mut self, uploader: Uploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_assistant(mut self, assistant: TravelAssistant) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn with_cron_secret(mut self, secret: Option<String>) -> Self {
        self.cron_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }
}
