use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use super::ledger::{post_entry, LedgerEntry};
use super::{
    enum_from_sql, enum_to_sql, is_unique_violation, page, parse_opt_ts, parse_opt_uuid, parse_ts,
    parse_uuid, ts, Store, StoreError, StoreResult,
};
use crate::crypto;
use crate::types::{CashbackTransaction, PromoCode, PromoStatus, TransactionKind};

const PROMO_COLUMNS: &str = "id, code, owner_id, amount, status, redeemed_by, redeemed_trip_id, \
     redeemed_at, expires_at, created_at";

pub const PROMO_CODE_LEN: usize = 8;
const CODE_ATTEMPTS: usize = 5;

impl Store {
    // -----------------------------------------------------------------------
    // Promo codes
    // -----------------------------------------------------------------------

    /// Issue a code worth `amount` against the owner's balance.
    ///
    /// The balance is not debited until redemption, but the sum of the
    /// owner's active codes may never exceed it.
    pub async fn create_promo_code(
        &self,
        owner_id: Uuid,
        amount: i64,
        min_amount: i64,
        ttl: Duration,
    ) -> StoreResult<PromoCode> {
        if amount < min_amount.max(1) {
            return Err(StoreError::Invalid(format!(
                "promo code amount must be at least {}",
                min_amount.max(1)
            )));
        }
        for _ in 0..CODE_ATTEMPTS {
            let code = crypto::generate_code(PROMO_CODE_LEN)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let now = Utc::now();
            let promo = PromoCode {
                id: Uuid::new_v4(),
                code,
                owner_id,
                amount,
                status: PromoStatus::Active,
                redeemed_by: None,
                redeemed_trip_id: None,
                redeemed_at: None,
                expires_at: now + ttl,
                created_at: now,
            };
            match self.insert_promo_code(promo).await {
                Err(StoreError::Conflict(_)) => continue,
                other => return other,
            }
        }
        Err(StoreError::Conflict(
            "could not allocate a unique promo code".into(),
        ))
    }

    /// `Conflict` only signals a code collision; balance problems are `Invalid`.
    async fn insert_promo_code(&self, promo: PromoCode) -> StoreResult<PromoCode> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let owner = promo.owner_id.to_string();
                let balance: Option<i64> = tx
                    .query_row(
                        "SELECT cashback_balance FROM users WHERE id = ?1",
                        rusqlite::params![owner],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(balance) = balance else {
                    return Ok(Err(StoreError::NotFound("user".into())));
                };
                let reserved: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(amount), 0) FROM promo_codes
                     WHERE owner_id = ?1 AND status = 'active'",
                    rusqlite::params![owner],
                    |row| row.get(0),
                )?;
                if promo.amount > balance - reserved {
                    return Ok(Err(StoreError::Invalid(format!(
                        "insufficient cashback balance: {} available",
                        (balance - reserved).max(0)
                    ))));
                }
                let res = tx.execute(
                    "INSERT INTO promo_codes (id, code, owner_id, amount, status, redeemed_by,
                        redeemed_trip_id, redeemed_at, expires_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?7)",
                    rusqlite::params![
                        promo.id.to_string(),
                        promo.code,
                        owner,
                        promo.amount,
                        enum_to_sql(&promo.status),
                        ts(&promo.expires_at),
                        ts(&promo.created_at),
                    ],
                );
                match res {
                    Ok(_) => {
                        tx.commit()?;
                        Ok(Ok(promo))
                    }
                    Err(e) if is_unique_violation(&e) => {
                        Ok(Err(StoreError::Conflict("promo code collision".into())))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?
    }

    pub async fn get_promo_code(&self, code: &str) -> StoreResult<Option<PromoCode>> {
        let code = normalize_code(code);
        let promo = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {PROMO_COLUMNS} FROM promo_codes WHERE code = ?1");
                Ok(conn
                    .query_row(&sql, rusqlite::params![code], row_to_promo)
                    .optional()?)
            })
            .await?;
        Ok(promo)
    }

    /// Codes of one owner, or every code when `owner_id` is `None`.
    pub async fn list_promo_codes(
        &self,
        owner_id: Option<Uuid>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<PromoCode>> {
        let owner = owner_id.map(|u| u.to_string());
        let (limit, offset) = page(limit, offset);
        let codes = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {PROMO_COLUMNS} FROM promo_codes
                     WHERE (?1 IS NULL OR owner_id = ?1)
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![owner, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_promo(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(codes)
    }

    /// Redeem a code: claim it `active -> redeemed` and debit the owner's
    /// balance in one transaction.
    ///
    /// Already redeemed is a `Conflict`; cancelled, expired or an owner
    /// balance that no longer covers the amount is `Invalid`.
    pub async fn redeem_promo_code(
        &self,
        code: &str,
        redeemed_by: Uuid,
        trip_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> StoreResult<(PromoCode, CashbackTransaction)> {
        let code = normalize_code(code);
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let sql = format!("SELECT {PROMO_COLUMNS} FROM promo_codes WHERE code = ?1");
                let Some(promo) = tx
                    .query_row(&sql, rusqlite::params![code], row_to_promo)
                    .optional()?
                else {
                    return Ok(Err(StoreError::NotFound("promo code".into())));
                };
                match promo.status {
                    PromoStatus::Active => {}
                    PromoStatus::Redeemed => {
                        return Ok(Err(StoreError::Conflict(
                            "promo code already redeemed".into(),
                        )))
                    }
                    other => {
                        return Ok(Err(StoreError::Invalid(format!(
                            "promo code is {}",
                            enum_to_sql(&other)
                        ))))
                    }
                }
                if promo.expires_at <= now {
                    return Ok(Err(StoreError::Invalid("promo code expired".into())));
                }

                let claimed = tx.execute(
                    "UPDATE promo_codes
                     SET status = 'redeemed', redeemed_by = ?2, redeemed_trip_id = ?3,
                         redeemed_at = ?4
                     WHERE id = ?1 AND status = 'active'",
                    rusqlite::params![
                        promo.id.to_string(),
                        redeemed_by.to_string(),
                        trip_id.map(|u| u.to_string()),
                        ts(&now),
                    ],
                )?;
                if claimed != 1 {
                    return Ok(Err(StoreError::Conflict(
                        "promo code already redeemed".into(),
                    )));
                }

                let mut entry =
                    LedgerEntry::new(promo.owner_id, -promo.amount, TransactionKind::PromoRedemption);
                entry.trip_id = trip_id;
                entry.promo_code_id = Some(promo.id);
                let posted = match post_entry(&tx, &entry)? {
                    Ok(posted) => posted,
                    Err(e) => return Ok(Err(e)),
                };

                let sql = format!("SELECT {PROMO_COLUMNS} FROM promo_codes WHERE id = ?1");
                let updated =
                    tx.query_row(&sql, rusqlite::params![promo.id.to_string()], row_to_promo)?;
                tx.commit()?;
                Ok(Ok((updated, posted)))
            })
            .await?
    }

    /// Cancel an active code, releasing its reservation.
    pub async fn cancel_promo_code(&self, id: Uuid) -> StoreResult<PromoCode> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE promo_codes SET status = 'cancelled' WHERE id = ?1 AND status = 'active'",
                    rusqlite::params![id],
                )?;
                let sql = format!("SELECT {PROMO_COLUMNS} FROM promo_codes WHERE id = ?1");
                let promo = conn
                    .query_row(&sql, rusqlite::params![id], row_to_promo)
                    .optional()?;
                Ok(match (promo, changed) {
                    (None, _) => Err(StoreError::NotFound("promo code".into())),
                    (Some(p), 1) => Ok(p),
                    (Some(_), _) => Err(StoreError::Conflict("promo code is not active".into())),
                })
            })
            .await?
    }

    /// Move every overdue active code to `expired`.
    pub async fn expire_promo_codes(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now = ts(&now);
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE promo_codes SET status = 'expired'
                     WHERE status = 'active' AND expires_at <= ?1",
                    rusqlite::params![now],
                )?)
            })
            .await?;
        Ok(n)
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn row_to_promo(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromoCode> {
    let id: String = row.get(0)?;
    let owner_id: String = row.get(2)?;
    let status: String = row.get(4)?;
    let redeemed_by: Option<String> = row.get(5)?;
    let redeemed_trip_id: Option<String> = row.get(6)?;
    let redeemed_at: Option<String> = row.get(7)?;
    let expires_at: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(PromoCode {
        id: parse_uuid(0, &id)?,
        code: row.get(1)?,
        owner_id: parse_uuid(2, &owner_id)?,
        amount: row.get(3)?,
        status: enum_from_sql(4, &status)?,
        redeemed_by: parse_opt_uuid(5, redeemed_by)?,
        redeemed_trip_id: parse_opt_uuid(6, redeemed_trip_id)?,
        redeemed_at: parse_opt_ts(7, redeemed_at)?,
        expires_at: parse_ts(8, &expires_at)?,
        created_at: parse_ts(9, &created_at)?,
    })
}
