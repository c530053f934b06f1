use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Privilege
// ---------------------------------------------------------------------------

/// Access tier of an account. Ordered so that `>=` comparisons gate endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    Client = 0,
    Manager = 1,
    Admin = 2,
}

impl Privilege {
    pub fn level(self) -> i64 {
        self as i64
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Privilege::Client),
            1 => Some(Privilege::Manager),
            2 => Some(Privilege::Admin),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub privilege: Privilege,
    pub phone_verified: bool,
    pub cashback_balance: i64,
    pub referral_code: String,
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        phone: impl Into<String>,
        name: impl Into<String>,
        password_hash: impl Into<String>,
        referral_code: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            phone: phone.into(),
            name: name.into(),
            email: None,
            password_hash: password_hash.into(),
            privilege: Privilege::Client,
            phone_verified: false,
            cashback_balance: 0,
            referral_code: referral_code.into(),
            referred_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_at_least(&self, privilege: Privilege) -> bool {
        self.privilege >= privilege
    }
}

// ---------------------------------------------------------------------------
// Session / OTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token_hash: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    VerifyPhone,
    ResetPassword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpCode {
    pub id: Uuid,
    pub phone: String,
    pub purpose: OtpPurpose,
    pub code_hash: String,
    pub attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trip
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Pending,
    Confirmed,
    Paid,
    Completed,
    Cancelled,
}

impl TripStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TripStatus) -> bool {
        matches!(
            (self, target),
            (TripStatus::Pending, TripStatus::Confirmed)
                | (TripStatus::Pending, TripStatus::Cancelled)
                | (TripStatus::Confirmed, TripStatus::Paid)
                | (TripStatus::Confirmed, TripStatus::Cancelled)
                | (TripStatus::Paid, TripStatus::Completed)
                | (TripStatus::Paid, TripStatus::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

/// Progress of an asynchronous bonus payout attached to a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    None,
    Pending,
    Credited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: Uuid,
    pub owner_phone: String,
    pub manager_phone: Option<String>,
    pub destination: String,
    pub hotel: Option<String>,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
    pub adults: u32,
    pub children: u32,
    pub price: i64,
    pub paid_amount: i64,
    pub status: TripStatus,
    pub cashback_percent: f64,
    pub cashback_status: PayoutStatus,
    pub referral_status: PayoutStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    pub fn new(
        owner_phone: impl Into<String>,
        destination: impl Into<String>,
        departure_date: NaiveDate,
        return_date: NaiveDate,
        price: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_phone: owner_phone.into(),
            manager_phone: None,
            destination: destination.into(),
            hotel: None,
            departure_date,
            return_date,
            adults: 1,
            children: 0,
            price,
            paid_amount: 0,
            status: TripStatus::Pending,
            cashback_percent: 0.0,
            cashback_status: PayoutStatus::None,
            referral_status: PayoutStatus::None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Cashback owed for this trip, rounded down to a whole minor unit.
    pub fn cashback_amount(&self) -> i64 {
        percent_of(self.paid_amount, self.cashback_percent)
    }
}

/// `amount * percent / 100`, floored, never negative.
pub fn percent_of(amount: i64, percent: f64) -> i64 {
    if amount <= 0 || percent <= 0.0 {
        return 0;
    }
    ((amount as f64) * percent / 100.0).floor() as i64
}

// ---------------------------------------------------------------------------
// Cashback ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    TripCashback,
    ReferralBonus,
    PromoRedemption,
    ManualAdjustment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashbackTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub trip_id: Option<Uuid>,
    pub promo_code_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub amount: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Promo codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoStatus {
    Active,
    Redeemed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCode {
    pub id: Uuid,
    pub code: String,
    pub owner_id: Uuid,
    pub amount: i64,
    pub status: PromoStatus,
    pub redeemed_by: Option<Uuid>,
    pub redeemed_trip_id: Option<Uuid>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Articles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub cover_image_url: Option<String>,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Contact requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRequest {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub message: String,
    pub preferred_date: Option<NaiveDate>,
    pub handled: bool,
    pub handled_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    TripUpdate,
    Cashback,
    Promo,
    Contact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: Uuid,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            title: title.into(),
            message: message.into(),
            read: false,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub entity: String,
    pub entity_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(
        actor_id: Option<Uuid>,
        action: impl Into<String>,
        entity: impl Into<String>,
        entity_id: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id,
            action: action.into(),
            entity: entity.into(),
            entity_id,
            details,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
