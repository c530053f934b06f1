use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.tourdesk/config.toml`.
///
/// **Security**: This struct NEVER stores API keys, tokens, or secrets.
/// All credentials are read from environment variables at runtime.
/// See [`CredentialProvider`] for the env-var-based credential model.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cashback: CashbackConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub widget: WidgetConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `$TOURDESK_CONFIG` or `~/.tourdesk/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port must be non-zero".into()));
        }
        if self.auth.session_ttl_hours == 0 {
            return Err(ConfigError::Validation(
                "auth.session_ttl_hours must be non-zero".into(),
            ));
        }
        if self.auth.otp_ttl_secs == 0 || self.auth.otp_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "auth.otp_ttl_secs and auth.otp_max_attempts must be non-zero".into(),
            ));
        }
        if self.auth.password_min_length < 6 {
            return Err(ConfigError::Validation(
                "auth.password_min_length must be at least 6".into(),
            ));
        }
        for (name, pct) in [
            ("cashback.default_percent", self.cashback.default_percent),
            ("cashback.referral_percent", self.cashback.referral_percent),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ConfigError::Validation(format!(
                    "{name} must be between 0 and 100, got {pct}"
                )));
            }
        }
        if self.cashback.promo_code_ttl_days == 0 {
            return Err(ConfigError::Validation(
                "cashback.promo_code_ttl_days must be non-zero".into(),
            ));
        }
        for (name, rule) in self.rate_limits.rules() {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "rate_limits.{name} needs a non-zero limit and window_secs"
                )));
            }
        }
        if self.cron.enabled && self.cron.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "cron.interval_secs must be non-zero when cron is enabled".into(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var("TOURDESK_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tourdesk")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra CORS origins beyond localhost.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Adds `Secure` to the session cookie. Turn off only for plain-http dev.
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Peers allowed to set `X-Forwarded-For` / `X-Real-IP`. Requests from
    /// anyone else are keyed on the socket address.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
            secure_cookies: true,
            body_limit_bytes: default_body_limit(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_true() -> bool {
    true
}
fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.tourdesk/tourdesk.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_hours: u64,
    #[serde(default = "default_otp_ttl")]
    pub otp_ttl_secs: u64,
    #[serde(default = "default_otp_attempts")]
    pub otp_max_attempts: u32,
    #[serde(default = "default_otp_cooldown")]
    pub otp_resend_cooldown_secs: u64,
    #[serde(default = "default_password_min")]
    pub password_min_length: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_session_ttl(),
            otp_ttl_secs: default_otp_ttl(),
            otp_max_attempts: default_otp_attempts(),
            otp_resend_cooldown_secs: default_otp_cooldown(),
            password_min_length: default_password_min(),
        }
    }
}

fn default_session_ttl() -> u64 {
    24 * 30
}
fn default_otp_ttl() -> u64 {
    300
}
fn default_otp_attempts() -> u32 {
    5
}
fn default_otp_cooldown() -> u64 {
    60
}
fn default_password_min() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashbackConfig {
    /// Percent of the paid amount credited to the trip owner.
    #[serde(default = "default_cashback_percent")]
    pub default_percent: f64,
    /// Percent of the paid amount credited to the owner's referrer.
    #[serde(default = "default_referral_percent")]
    pub referral_percent: f64,
    #[serde(default = "default_promo_ttl")]
    pub promo_code_ttl_days: u64,
    #[serde(default = "default_min_promo")]
    pub min_promo_amount: i64,
}

impl Default for CashbackConfig {
    fn default() -> Self {
        Self {
            default_percent: default_cashback_percent(),
            referral_percent: default_referral_percent(),
            promo_code_ttl_days: default_promo_ttl(),
            min_promo_amount: default_min_promo(),
        }
    }
}

fn default_cashback_percent() -> f64 {
    3.0
}
fn default_referral_percent() -> f64 {
    1.0
}
fn default_promo_ttl() -> u64 {
    30
}
fn default_min_promo() -> i64 {
    100
}

/// A single rate-limit rule: at most `limit` hits per sliding `window_secs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSection {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitSection {
    const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_rl_global")]
    pub global: RateLimitSection,
    #[serde(default = "default_rl_login")]
    pub login: RateLimitSection,
    #[serde(default = "default_rl_otp")]
    pub otp: RateLimitSection,
    #[serde(default = "default_rl_contact")]
    pub contact: RateLimitSection,
    #[serde(default = "default_rl_chat")]
    pub chat: RateLimitSection,
}

impl RateLimitsConfig {
    /// Namespace name paired with its rule.
    pub fn rules(&self) -> [(&'static str, RateLimitSection); 5] {
        [
            ("global", self.global),
            ("login", self.login),
            ("otp", self.otp),
            ("contact", self.contact),
            ("chat", self.chat),
        ]
    }
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            global: default_rl_global(),
            login: default_rl_login(),
            otp: default_rl_otp(),
            contact: default_rl_contact(),
            chat: default_rl_chat(),
        }
    }
}

fn default_rl_global() -> RateLimitSection {
    RateLimitSection::new(300, 60)
}
fn default_rl_login() -> RateLimitSection {
    RateLimitSection::new(10, 600)
}
fn default_rl_otp() -> RateLimitSection {
    RateLimitSection::new(5, 600)
}
fn default_rl_contact() -> RateLimitSection {
    RateLimitSection::new(5, 3600)
}
fn default_rl_chat() -> RateLimitSection {
    RateLimitSection::new(30, 600)
}

/// SMS gateway settings. The API key lives in the env var named here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_sms_url")]
    pub base_url: String,
    #[serde(default = "default_sms_sender")]
    pub sender: String,
    #[serde(default = "default_sms_key_env")]
    pub api_key_env: String,
    /// Phone that receives contact-request alerts.
    #[serde(default)]
    pub admin_phone: Option<String>,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            base_url: default_sms_url(),
            sender: default_sms_sender(),
            api_key_env: default_sms_key_env(),
            admin_phone: None,
        }
    }
}

fn default_sms_url() -> String {
    "https://sms.example.com/api/v1".into()
}
fn default_sms_sender() -> String {
    "TourDesk".into()
}
fn default_sms_key_env() -> String {
    "TOURDESK_SMS_API_KEY".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_storage_token_env")]
    pub token_env: String,
    #[serde(default = "default_upload_max")]
    pub max_upload_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: default_bucket(),
            public_base_url: None,
            token_env: default_storage_token_env(),
            max_upload_bytes: default_upload_max(),
        }
    }
}

fn default_bucket() -> String {
    "tourdesk-media".into()
}
fn default_storage_token_env() -> String {
    "TOURDESK_STORAGE_TOKEN".into()
}
fn default_upload_max() -> usize {
    5 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// `anthropic`, `openai`, or `none`.
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_ai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_ai_max_tokens")]
    pub max_tokens: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            model: default_ai_model(),
            base_url: None,
            api_key_env: default_ai_key_env(),
            max_tokens: default_ai_max_tokens(),
        }
    }
}

fn default_ai_provider() -> String {
    "anthropic".into()
}
fn default_ai_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_ai_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_ai_max_tokens() -> u32 {
    800
}

/// Public settings for the embedded tour-search widget.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WidgetConfig {
    #[serde(default)]
    pub script_url: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub default_departure_city: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Run cron jobs in-process in addition to the HTTP triggers.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cron_interval")]
    pub interval_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_cron_interval(),
        }
    }
}

fn default_cron_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,td_bridge=debug".into()
}

// ---------------------------------------------------------------------------
// Credential provider (reads secrets from environment at runtime)
// ---------------------------------------------------------------------------

/// Reads credentials from environment variables at runtime.
///
/// Config stores env var *names*; this provider resolves them to values on
/// demand. Empty values count as unset.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Bearer secret for `/api/cron/*`. `None` disables the cron endpoints.
    pub fn cron_secret() -> Option<String> {
        Self::from_env("TOURDESK_CRON_SECRET")
    }

    /// Server-side pepper for OTP hashes.
    pub fn otp_secret() -> Option<String> {
        Self::from_env("TOURDESK_OTP_SECRET")
    }

    /// Read a credential from a named env var.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Names of integrations that have credentials available.
    pub fn available_integrations(config: &Config) -> Vec<&'static str> {
        let mut found = Vec::new();
        if Self::from_env(&config.sms.api_key_env).is_some() {
            found.push("sms");
        }
        if Self::from_env(&config.storage.token_env).is_some() {
            found.push("storage");
        }
        if Self::from_env(&config.ai.api_key_env).is_some() {
            found.push("ai");
        }
        if Self::cron_secret().is_some() {
            found.push("cron");
        }
        found
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
