use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use super::users::{row_to_user, USER_COLUMNS};
use super::{enum_from_sql, enum_to_sql, parse_opt_ts, parse_ts, parse_uuid, ts, Store, StoreResult};
use crate::types::{OtpCode, OtpPurpose, Session, User};

impl Store {
    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn create_session(&self, session: &Session) -> StoreResult<()> {
        let session = session.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        session.token_hash,
                        session.user_id.to_string(),
                        ts(&session.created_at),
                        ts(&session.expires_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Look up the account behind a token digest, ignoring expired sessions.
    pub async fn resolve_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let token_hash = token_hash.to_string();
        let now = ts(&now);
        let user = self
            .conn
            .call(move |conn| {
                let user_id: Option<String> = conn
                    .query_row(
                        "SELECT user_id FROM sessions WHERE token_hash = ?1 AND expires_at > ?2",
                        rusqlite::params![token_hash, now],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(user_id) = user_id else {
                    return Ok(None);
                };
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
                Ok(conn
                    .query_row(&sql, rusqlite::params![user_id], row_to_user)
                    .optional()?)
            })
            .await?;
        Ok(user)
    }

    pub async fn delete_session(&self, token_hash: &str) -> StoreResult<bool> {
        let token_hash = token_hash.to_string();
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE token_hash = ?1",
                    rusqlite::params![token_hash],
                )?)
            })
            .await?;
        Ok(n > 0)
    }

    /// Revoke every session of a user, e.g. after a password reset.
    pub async fn delete_user_sessions(&self, user_id: Uuid) -> StoreResult<usize> {
        let user_id = user_id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE user_id = ?1",
                    rusqlite::params![user_id],
                )?)
            })
            .await?;
        Ok(n)
    }

    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now = ts(&now);
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?)
            })
            .await?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // OTP codes
    // -----------------------------------------------------------------------

    /// Store a fresh code. Earlier unconsumed codes for the same phone and
    /// purpose are consumed in the same transaction so only one is live.
    pub async fn insert_otp(&self, otp: &OtpCode) -> StoreResult<()> {
        let otp = otp.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let purpose = enum_to_sql(&otp.purpose);
                tx.execute(
                    "UPDATE otp_codes SET consumed_at = ?1
                     WHERE phone = ?2 AND purpose = ?3 AND consumed_at IS NULL",
                    rusqlite::params![ts(&otp.created_at), otp.phone, purpose],
                )?;
                tx.execute(
                    "INSERT INTO otp_codes (id, phone, purpose, code_hash, attempts,
                        expires_at, consumed_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        otp.id.to_string(),
                        otp.phone,
                        purpose,
                        otp.code_hash,
                        otp.attempts,
                        ts(&otp.expires_at),
                        otp.consumed_at.as_ref().map(ts),
                        ts(&otp.created_at),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent unconsumed code for phone and purpose, expired or not.
    pub async fn latest_otp(
        &self,
        phone: &str,
        purpose: OtpPurpose,
    ) -> StoreResult<Option<OtpCode>> {
        let phone = phone.to_string();
        let purpose = enum_to_sql(&purpose);
        let otp = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, phone, purpose, code_hash, attempts, expires_at,
                                consumed_at, created_at
                         FROM otp_codes
                         WHERE phone = ?1 AND purpose = ?2 AND consumed_at IS NULL
                         ORDER BY created_at DESC LIMIT 1",
                        rusqlite::params![phone, purpose],
                        row_to_otp,
                    )
                    .optional()?)
            })
            .await?;
        Ok(otp)
    }

    /// Creation time of the newest code for phone and purpose, consumed or
    /// not. Drives the resend cooldown.
    pub async fn last_otp_issued_at(
        &self,
        phone: &str,
        purpose: OtpPurpose,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let phone = phone.to_string();
        let purpose = enum_to_sql(&purpose);
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT MAX(created_at) FROM otp_codes WHERE phone = ?1 AND purpose = ?2",
                        rusqlite::params![phone, purpose],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()?
                    .flatten())
            })
            .await?;
        match raw {
            Some(s) => Ok(Some(parse_ts(0, &s)?)),
            None => Ok(None),
        }
    }

    /// Spend one attempt on a live code. The conditional update is the
    /// lockout: once `attempts` reaches `max_attempts` no caller can claim
    /// another, however many verify at once. Returns the new count, or
    /// `None` when the code is locked or already consumed.
    pub async fn claim_otp_attempt(&self, id: Uuid, max_attempts: u32) -> StoreResult<Option<u32>> {
        let id = id.to_string();
        let attempts = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let claimed = tx.execute(
                    "UPDATE otp_codes SET attempts = attempts + 1
                     WHERE id = ?1 AND consumed_at IS NULL AND attempts < ?2",
                    rusqlite::params![id, max_attempts],
                )?;
                let attempts = if claimed == 1 {
                    Some(tx.query_row(
                        "SELECT attempts FROM otp_codes WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )?)
                } else {
                    None
                };
                tx.commit()?;
                Ok(attempts)
            })
            .await?;
        Ok(attempts)
    }

    /// Mark a code used. Returns `false` if it was already consumed or has
    /// spent more than `max_attempts`.
    pub async fn consume_otp(
        &self,
        id: Uuid,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let id = id.to_string();
        let now = ts(&now);
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE otp_codes SET consumed_at = ?1
                     WHERE id = ?2 AND consumed_at IS NULL AND attempts <= ?3",
                    rusqlite::params![now, id, max_attempts],
                )?)
            })
            .await?;
        Ok(n == 1)
    }

    /// Remove codes whose expiry has passed.
    pub async fn purge_expired_otps(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now = ts(&now);
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM otp_codes WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?)
            })
            .await?;
        Ok(n)
    }
}

fn row_to_otp(row: &rusqlite::Row<'_>) -> rusqlite::Result<OtpCode> {
    let id: String = row.get(0)?;
    let purpose: String = row.get(2)?;
    let expires_at: String = row.get(5)?;
    let consumed_at: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(OtpCode {
        id: parse_uuid(0, &id)?,
        phone: row.get(1)?,
        purpose: enum_from_sql(2, &purpose)?,
        code_hash: row.get(3)?,
        attempts: row.get(4)?,
        expires_at: parse_ts(5, &expires_at)?,
        consumed_at: parse_opt_ts(6, consumed_at)?,
        created_at: parse_ts(7, &created_at)?,
    })
}
