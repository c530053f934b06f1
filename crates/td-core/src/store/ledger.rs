//! Cashback balances and the ledger that explains them.
//!
//! A balance only ever changes through [`post_entry`], which writes the
//! matching `cashback_transactions` row in the caller's transaction. Trip
//! payouts are claimed with a conditional `UPDATE ... WHERE x_status =
//! 'pending'` before any money moves, so a second run finds nothing to claim.

use chrono::{NaiveDate, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use super::trips::{complete_in_tx, load_trip, row_to_trip, TRIP_COLUMNS};
use super::{enum_from_sql, enum_to_sql, page, parse_opt_uuid, parse_ts, parse_uuid, ts};
use super::{Store, StoreError, StoreResult};
use crate::types::{percent_of, CashbackTransaction, TransactionKind, Trip};

/// A single balance movement to be posted.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub amount: i64,
    pub kind: TransactionKind,
    pub trip_id: Option<Uuid>,
    pub promo_code_id: Option<Uuid>,
}

impl LedgerEntry {
    pub fn new(user_id: Uuid, amount: i64, kind: TransactionKind) -> Self {
        Self {
            user_id,
            amount,
            kind,
            trip_id: None,
            promo_code_id: None,
        }
    }
}

impl Store {
    /// Post a manual or programmatic balance change. The resulting balance
    /// may not go negative.
    pub async fn adjust_balance(&self, entry: LedgerEntry) -> StoreResult<CashbackTransaction> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let posted = post_entry(&tx, &entry)?;
                if posted.is_ok() {
                    tx.commit()?;
                }
                Ok(posted)
            })
            .await?
    }

    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<CashbackTransaction>> {
        let user_id = user_id.to_string();
        let (limit, offset) = page(limit, offset);
        let txs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, trip_id, promo_code_id, kind, amount, balance_after,
                            created_at
                     FROM cashback_transactions WHERE user_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_id, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_transaction(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(txs)
    }

    // -----------------------------------------------------------------------
    // Batch jobs
    // -----------------------------------------------------------------------

    /// Complete every `paid` trip whose return date is before `today` and
    /// queue its payouts. Returns the trips that changed in this call.
    pub async fn complete_finished_trips(&self, today: NaiveDate) -> StoreResult<Vec<Trip>> {
        let today = today.to_string();
        let trips = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM trips WHERE status = 'paid' AND return_date < ?1",
                    )?;
                    let rows = stmt.query_map(rusqlite::params![today], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                let now = ts(&Utc::now());
                let mut done = Vec::with_capacity(ids.len());
                for id in ids {
                    if complete_in_tx(&tx, &id, &now)?.is_some() {
                        if let Some(trip) = load_trip(&tx, &id)? {
                            done.push(trip);
                        }
                    }
                }
                tx.commit()?;
                Ok(done)
            })
            .await?;
        Ok(trips)
    }

    /// Completed trips with at least one payout still `pending`.
    pub async fn list_trips_awaiting_cashback(&self) -> StoreResult<Vec<Trip>> {
        let trips = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     WHERE status = 'completed'
                       AND (cashback_status = 'pending' OR referral_status = 'pending')
                     ORDER BY updated_at"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_trip(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(trips)
    }

    /// Claim the trip's cashback and credit its owner, in one transaction.
    ///
    /// `Ok(None)` means there was nothing to do: the payout was already
    /// claimed, or the computed amount is zero (the claim is still recorded).
    pub async fn credit_trip_cashback(
        &self,
        trip_id: Uuid,
    ) -> StoreResult<Option<CashbackTransaction>> {
        let id = trip_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let claimed = tx.execute(
                    "UPDATE trips SET cashback_status = 'credited', updated_at = ?2
                     WHERE id = ?1 AND status = 'completed' AND cashback_status = 'pending'",
                    rusqlite::params![id, ts(&Utc::now())],
                )?;
                if claimed != 1 {
                    return Ok(Ok(None));
                }
                let Some(trip) = load_trip(&tx, &id)? else {
                    return Ok(Err(StoreError::NotFound("trip".into())));
                };
                let amount = trip.cashback_amount();
                if amount == 0 {
                    tx.commit()?;
                    return Ok(Ok(None));
                }
                let Some(owner_id) = user_id_by_phone(&tx, &trip.owner_phone)? else {
                    return Ok(Err(StoreError::NotFound("trip owner".into())));
                };
                let mut entry = LedgerEntry::new(owner_id, amount, TransactionKind::TripCashback);
                entry.trip_id = Some(trip.id);
                match post_entry(&tx, &entry)? {
                    Ok(posted) => {
                        tx.commit()?;
                        Ok(Ok(Some(posted)))
                    }
                    Err(e) => Ok(Err(e)),
                }
            })
            .await?
    }

    /// Claim the trip's referral bonus and credit the owner's referrer with
    /// `percent` of the paid amount. Same contract as
    /// [`credit_trip_cashback`](Self::credit_trip_cashback); an owner without
    /// a referrer settles the claim with no payout.
    pub async fn credit_referral_bonus(
        &self,
        trip_id: Uuid,
        percent: f64,
    ) -> StoreResult<Option<CashbackTransaction>> {
        let id = trip_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let claimed = tx.execute(
                    "UPDATE trips SET referral_status = 'credited', updated_at = ?2
                     WHERE id = ?1 AND status = 'completed' AND referral_status = 'pending'",
                    rusqlite::params![id, ts(&Utc::now())],
                )?;
                if claimed != 1 {
                    return Ok(Ok(None));
                }
                let Some(trip) = load_trip(&tx, &id)? else {
                    return Ok(Err(StoreError::NotFound("trip".into())));
                };
                let referrer: Option<String> = tx
                    .query_row(
                        "SELECT referred_by FROM users WHERE phone = ?1",
                        rusqlite::params![trip.owner_phone],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()?
                    .flatten();
                let amount = percent_of(trip.paid_amount, percent);
                let referrer = match parse_opt_uuid(0, referrer)? {
                    Some(r) if amount > 0 => r,
                    _ => {
                        tx.commit()?;
                        return Ok(Ok(None));
                    }
                };
                let mut entry = LedgerEntry::new(referrer, amount, TransactionKind::ReferralBonus);
                entry.trip_id = Some(trip.id);
                match post_entry(&tx, &entry)? {
                    Ok(posted) => {
                        tx.commit()?;
                        Ok(Ok(Some(posted)))
                    }
                    Err(e) => Ok(Err(e)),
                }
            })
            .await?
    }
}

// ---------------------------------------------------------------------------
// Posting
// ---------------------------------------------------------------------------

/// Apply `entry` to the user's balance and write its ledger row. Domain
/// failures (missing user, balance would go negative) come back in the inner
/// `Result` so the caller can drop its transaction.
pub(super) fn post_entry(
    tx: &rusqlite::Transaction<'_>,
    entry: &LedgerEntry,
) -> rusqlite::Result<StoreResult<CashbackTransaction>> {
    let user_id = entry.user_id.to_string();
    let balance: Option<i64> = tx
        .query_row(
            "SELECT cashback_balance FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(balance) = balance else {
        return Ok(Err(StoreError::NotFound("user".into())));
    };
    let after = match balance.checked_add(entry.amount) {
        Some(after) if after >= 0 => after,
        _ => {
            return Ok(Err(StoreError::Invalid(
                "insufficient cashback balance".into(),
            )))
        }
    };

    let now = Utc::now();
    tx.execute(
        "UPDATE users SET cashback_balance = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![after, ts(&now), user_id],
    )?;
    let posted = CashbackTransaction {
        id: Uuid::new_v4(),
        user_id: entry.user_id,
        trip_id: entry.trip_id,
        promo_code_id: entry.promo_code_id,
        kind: entry.kind,
        amount: entry.amount,
        balance_after: after,
        created_at: now,
    };
    tx.execute(
        "INSERT INTO cashback_transactions (id, user_id, trip_id, promo_code_id, kind,
            amount, balance_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            posted.id.to_string(),
            user_id,
            posted.trip_id.map(|u| u.to_string()),
            posted.promo_code_id.map(|u| u.to_string()),
            enum_to_sql(&posted.kind),
            posted.amount,
            posted.balance_after,
            ts(&posted.created_at),
        ],
    )?;
    Ok(Ok(posted))
}

fn user_id_by_phone(conn: &rusqlite::Connection, phone: &str) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE phone = ?1",
            rusqlite::params![phone],
            |row| row.get(0),
        )
        .optional()?;
    parse_opt_uuid(0, raw)
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<CashbackTransaction> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let trip_id: Option<String> = row.get(2)?;
    let promo_code_id: Option<String> = row.get(3)?;
    let kind: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    Ok(CashbackTransaction {
        id: parse_uuid(0, &id)?,
        user_id: parse_uuid(1, &user_id)?,
        trip_id: parse_opt_uuid(2, trip_id)?,
        promo_code_id: parse_opt_uuid(3, promo_code_id)?,
        kind: enum_from_sql(4, &kind)?,
        amount: row.get(5)?,
        balance_after: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
    })
}
