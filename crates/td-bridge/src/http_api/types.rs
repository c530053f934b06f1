use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use td_core::types::{
    CashbackTransaction, OtpPurpose, Privilege, PromoCode, TripStatus, User,
};
use td_intelligence::ChatTurn;
use td_telemetry::metrics::MetricsSnapshot;

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub phone: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub user: User,
    /// When the verification code sent by SMS stops working.
    pub otp_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtpRequest {
    pub phone: String,
    pub purpose: OtpPurpose,
}

/// Password reset requests answer `accepted: true` for unknown numbers too.
#[derive(Debug, Clone, Serialize)]
pub struct OtpResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPhoneRequest {
    pub phone: String,
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordResetRequest {
    pub phone: String,
    pub code: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub email: Option<String>,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserListQuery {
    pub search: Option<String>,
    pub min_privilege: Option<Privilege>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPrivilegeRequest {
    pub privilege: Privilege,
}

/// Signed manual correction of a cashback balance.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceAdjustmentRequest {
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Trips
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TripListQuery {
    pub status: Option<TripStatus>,
    pub owner_phone: Option<String>,
    pub manager_phone: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTripRequest {
    pub owner_phone: String,
    #[serde(default)]
    pub manager_phone: Option<String>,
    pub destination: String,
    #[serde(default)]
    pub hotel: Option<String>,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
    #[serde(default)]
    pub adults: Option<u32>,
    #[serde(default)]
    pub children: Option<u32>,
    pub price: i64,
    #[serde(default)]
    pub paid_amount: Option<i64>,
    #[serde(default)]
    pub cashback_percent: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripStatusRequest {
    pub status: TripStatus,
}

// ---------------------------------------------------------------------------
// Promo codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromoListQuery {
    /// Managers only; clients always see their own codes.
    pub owner_id: Option<Uuid>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePromoRequest {
    pub amount: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedeemPromoRequest {
    #[serde(default)]
    pub trip_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedeemPromoResponse {
    pub promo_code: PromoCode,
    pub transaction: CashbackTransaction,
}

// ---------------------------------------------------------------------------
// Articles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArticleListQuery {
    /// Include unpublished drafts. Ignored below manager privilege.
    #[serde(default)]
    pub drafts: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateArticleRequest {
    pub title: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub summary: String,
    pub body: String,
    #[serde(default)]
    pub cover_image_url: Option<String>,
    #[serde(default)]
    pub published: bool,
}

// ---------------------------------------------------------------------------
// Contact requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ContactSubmission {
    pub name: String,
    pub phone: String,
    pub message: String,
    #[serde(default)]
    pub preferred_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactListQuery {
    pub handled: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// ---------------------------------------------------------------------------
// Notifications, audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditLogQuery {
    pub entity: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationStatus {
    pub sms: bool,
    pub storage: bool,
    pub ai: bool,
    pub cron: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub metrics: MetricsSnapshot,
    pub integrations: IntegrationStatus,
}
