//! Async SQLite-backed persistence for every tourdesk entity.
//!
//! One `tokio_rusqlite::Connection` serialises all access on its own thread,
//! so each `call` closure observes a consistent database. Multi-step writes
//! (balance credits, promo redemption) run inside a single transaction and
//! claim their row with a conditional `UPDATE ... WHERE status = ?` first.

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use tokio_rusqlite::Connection;
use uuid::Uuid;

mod content;
mod ledger;
mod notifications;
mod promo;
mod sessions;
mod trips;
mod users;

pub use content::{ArticleUpdate, ContactFilter};
pub use ledger::LedgerEntry;
pub use notifications::NotificationCounts;
pub use promo::PROMO_CODE_LEN;
pub use trips::{validate_trip, TripFilter, TripUpdate};
pub use users::UserFilter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the application database. Cheap to share behind an `Arc`.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(format!("create db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS users (
                        id               TEXT PRIMARY KEY,
                        phone            TEXT NOT NULL UNIQUE,
                        name             TEXT NOT NULL,
                        email            TEXT,
                        password_hash    TEXT NOT NULL,
                        privilege        INTEGER NOT NULL DEFAULT 0,
                        phone_verified   INTEGER NOT NULL DEFAULT 0,
                        cashback_balance INTEGER NOT NULL DEFAULT 0,
                        referral_code    TEXT NOT NULL UNIQUE,
                        referred_by      TEXT,
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS sessions (
                        token_hash TEXT PRIMARY KEY,
                        user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                        created_at TEXT NOT NULL,
                        expires_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

                    CREATE TABLE IF NOT EXISTS otp_codes (
                        id          TEXT PRIMARY KEY,
                        phone       TEXT NOT NULL,
                        purpose     TEXT NOT NULL,
                        code_hash   TEXT NOT NULL,
                        attempts    INTEGER NOT NULL DEFAULT 0,
                        expires_at  TEXT NOT NULL,
                        consumed_at TEXT,
                        created_at  TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_otp_phone ON otp_codes(phone, purpose);

                    CREATE TABLE IF NOT EXISTS trips (
                        id               TEXT PRIMARY KEY,
                        owner_phone      TEXT NOT NULL,
                        manager_phone    TEXT,
                        destination      TEXT NOT NULL,
                        hotel            TEXT,
                        departure_date   TEXT NOT NULL,
                        return_date      TEXT NOT NULL,
                        adults           INTEGER NOT NULL,
                        children         INTEGER NOT NULL,
                        price            INTEGER NOT NULL,
                        paid_amount      INTEGER NOT NULL,
                        status           TEXT NOT NULL,
                        cashback_percent REAL NOT NULL,
                        cashback_status  TEXT NOT NULL,
                        referral_status  TEXT NOT NULL,
                        notes            TEXT,
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_trips_owner   ON trips(owner_phone);
                    CREATE INDEX IF NOT EXISTS idx_trips_manager ON trips(manager_phone);
                    CREATE INDEX IF NOT EXISTS idx_trips_status  ON trips(status);

                    CREATE TABLE IF NOT EXISTS cashback_transactions (
                        id            TEXT PRIMARY KEY,
                        user_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                        trip_id       TEXT,
                        promo_code_id TEXT,
                        kind          TEXT NOT NULL,
                        amount        INTEGER NOT NULL,
                        balance_after INTEGER NOT NULL,
                        created_at    TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_tx_user ON cashback_transactions(user_id);
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_trip_payout
                        ON cashback_transactions(trip_id, kind)
                        WHERE trip_id IS NOT NULL
                          AND kind IN ('trip_cashback', 'referral_bonus');

                    CREATE TABLE IF NOT EXISTS promo_codes (
                        id               TEXT PRIMARY KEY,
                        code             TEXT NOT NULL UNIQUE,
                        owner_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                        amount           INTEGER NOT NULL,
                        status           TEXT NOT NULL,
                        redeemed_by      TEXT,
                        redeemed_trip_id TEXT,
                        redeemed_at      TEXT,
                        expires_at       TEXT NOT NULL,
                        created_at       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_promo_owner ON promo_codes(owner_id);

                    CREATE TABLE IF NOT EXISTS articles (
                        id              TEXT PRIMARY KEY,
                        slug            TEXT NOT NULL UNIQUE,
                        title           TEXT NOT NULL,
                        summary         TEXT NOT NULL,
                        body            TEXT NOT NULL,
                        cover_image_url TEXT,
                        published       INTEGER NOT NULL DEFAULT 0,
                        published_at    TEXT,
                        author_id       TEXT NOT NULL,
                        created_at      TEXT NOT NULL,
                        updated_at      TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS contact_requests (
                        id             TEXT PRIMARY KEY,
                        name           TEXT NOT NULL,
                        phone          TEXT NOT NULL,
                        message        TEXT NOT NULL,
                        preferred_date TEXT,
                        handled        INTEGER NOT NULL DEFAULT 0,
                        handled_by     TEXT,
                        created_at     TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS notifications (
                        id         TEXT PRIMARY KEY,
                        user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                        kind       TEXT NOT NULL,
                        title      TEXT NOT NULL,
                        message    TEXT NOT NULL,
                        read       INTEGER NOT NULL DEFAULT 0,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);

                    CREATE TABLE IF NOT EXISTS audit_logs (
                        id         TEXT PRIMARY KEY,
                        actor_id   TEXT,
                        action     TEXT NOT NULL,
                        entity     TEXT NOT NULL,
                        entity_id  TEXT,
                        details    TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_logs(entity);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// helpers – Rust values <-> SQLite columns
// ---------------------------------------------------------------------------

/// Snake-case name of a unit enum, as serde writes it.
pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    serde_json::to_value(val)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Fixed-width UTC timestamp so that string comparison in SQL orders correctly.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    raw.parse::<NaiveDate>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_uuid(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    raw.map(|s| parse_uuid(idx, &s)).transpose()
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Clamp user-supplied paging values.
pub(crate) fn page(limit: Option<usize>, offset: Option<usize>) -> (i64, i64) {
    let limit = limit.unwrap_or(50).clamp(1, 500) as i64;
    let offset = offset.unwrap_or(0).min(1_000_000) as i64;
    (limit, offset)
}
