use chrono::{NaiveDate, Utc};
use rusqlite::OptionalExtension;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    enum_from_sql, enum_to_sql, page, parse_date, parse_ts, parse_uuid, ts, Store, StoreError,
    StoreResult,
};
use crate::types::{PayoutStatus, Trip, TripStatus};

pub(super) const TRIP_COLUMNS: &str = "id, owner_phone, manager_phone, destination, hotel, \
     departure_date, return_date, adults, children, price, paid_amount, status, \
     cashback_percent, cashback_status, referral_status, notes, created_at, updated_at";

#[derive(Debug, Clone, Default)]
pub struct TripFilter {
    pub owner_phone: Option<String>,
    pub manager_phone: Option<String>,
    pub status: Option<TripStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Partial update of a trip's editable fields. Status is changed only through
/// [`Store::set_trip_status`]. For the nullable text fields an empty string
/// clears the value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TripUpdate {
    pub manager_phone: Option<String>,
    pub destination: Option<String>,
    pub hotel: Option<String>,
    pub departure_date: Option<NaiveDate>,
    pub return_date: Option<NaiveDate>,
    pub adults: Option<u32>,
    pub children: Option<u32>,
    pub price: Option<i64>,
    pub paid_amount: Option<i64>,
    pub cashback_percent: Option<f64>,
    pub notes: Option<String>,
}

impl TripUpdate {
    pub fn apply(self, trip: &mut Trip) -> StoreResult<()> {
        fn nullable(v: String) -> Option<String> {
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        }
        if let Some(v) = self.manager_phone {
            trip.manager_phone = nullable(v);
        }
        if let Some(v) = self.destination {
            trip.destination = v.trim().to_string();
        }
        if let Some(v) = self.hotel {
            trip.hotel = nullable(v);
        }
        if let Some(v) = self.notes {
            trip.notes = nullable(v);
        }
        if let Some(v) = self.departure_date {
            trip.departure_date = v;
        }
        if let Some(v) = self.return_date {
            trip.return_date = v;
        }
        if let Some(v) = self.adults {
            trip.adults = v;
        }
        if let Some(v) = self.children {
            trip.children = v;
        }
        if let Some(v) = self.price {
            trip.price = v;
        }
        if let Some(v) = self.paid_amount {
            trip.paid_amount = v;
        }
        if let Some(v) = self.cashback_percent {
            trip.cashback_percent = v;
        }
        validate_trip(trip)
    }
}

/// Field invariants every stored trip must satisfy.
pub fn validate_trip(trip: &Trip) -> StoreResult<()> {
    if trip.destination.trim().is_empty() {
        return Err(StoreError::Invalid("destination is required".into()));
    }
    if trip.return_date < trip.departure_date {
        return Err(StoreError::Invalid(
            "return date must not be before departure date".into(),
        ));
    }
    if trip.adults == 0 {
        return Err(StoreError::Invalid("at least one adult is required".into()));
    }
    if trip.price < 0 || trip.paid_amount < 0 {
        return Err(StoreError::Invalid("amounts must not be negative".into()));
    }
    if !(0.0..=100.0).contains(&trip.cashback_percent) {
        return Err(StoreError::Invalid(
            "cashback percent must be between 0 and 100".into(),
        ));
    }
    Ok(())
}

impl Store {
    // -----------------------------------------------------------------------
    // Trips
    // -----------------------------------------------------------------------

    pub async fn create_trip(&self, trip: &Trip) -> StoreResult<()> {
        validate_trip(trip)?;
        let trip = trip.clone();
        self.conn
            .call(move |conn| {
                write_trip(conn, &trip, true)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_trip(&self, id: Uuid) -> StoreResult<Option<Trip>> {
        let id = id.to_string();
        let trip = self
            .conn
            .call(move |conn| Ok(load_trip(conn, &id)?))
            .await?;
        Ok(trip)
    }

    /// Trips newest departure first, optionally filtered.
    pub async fn list_trips(&self, filter: &TripFilter) -> StoreResult<Vec<Trip>> {
        let owner = filter.owner_phone.clone();
        let manager = filter.manager_phone.clone();
        let status = filter.status.as_ref().map(enum_to_sql);
        let (limit, offset) = page(filter.limit, filter.offset);
        let trips = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     WHERE (?1 IS NULL OR owner_phone = ?1)
                       AND (?2 IS NULL OR manager_phone = ?2)
                       AND (?3 IS NULL OR status = ?3)
                     ORDER BY departure_date DESC, created_at DESC
                     LIMIT ?4 OFFSET ?5"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows =
                    stmt.query(rusqlite::params![owner, manager, status, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_trip(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(trips)
    }

    /// Apply a partial update and return the stored trip.
    pub async fn update_trip(&self, id: Uuid, update: TripUpdate) -> StoreResult<Trip> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut trip) = load_trip(&tx, &id)? else {
                    return Ok(Err(StoreError::NotFound("trip".into())));
                };
                if let Err(e) = update.apply(&mut trip) {
                    return Ok(Err(e));
                }
                trip.updated_at = Utc::now();
                write_trip(&tx, &trip, false)?;
                tx.commit()?;
                Ok(Ok(trip))
            })
            .await?
    }

    /// Move a trip along its lifecycle. Entering `Completed` also queues the
    /// cashback and referral payouts.
    pub async fn set_trip_status(&self, id: Uuid, target: TripStatus) -> StoreResult<Trip> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(trip) = load_trip(&tx, &id)? else {
                    return Ok(Err(StoreError::NotFound("trip".into())));
                };
                if !trip.status.can_transition_to(&target) {
                    return Ok(Err(StoreError::Invalid(format!(
                        "cannot move trip from {} to {}",
                        enum_to_sql(&trip.status),
                        enum_to_sql(&target)
                    ))));
                }
                let now = ts(&Utc::now());
                let claimed = if target == TripStatus::Completed {
                    complete_in_tx(&tx, &id, &now)?.is_some()
                } else {
                    tx.execute(
                        "UPDATE trips SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                        rusqlite::params![
                            enum_to_sql(&target),
                            now,
                            id,
                            enum_to_sql(&trip.status)
                        ],
                    )? == 1
                };
                if !claimed {
                    return Ok(Err(StoreError::Conflict(
                        "trip status changed concurrently".into(),
                    )));
                }
                let updated = load_trip(&tx, &id)?;
                tx.commit()?;
                Ok(updated.ok_or_else(|| StoreError::NotFound("trip".into())))
            })
            .await?
    }

    pub async fn delete_trip(&self, id: Uuid) -> StoreResult<bool> {
        let id = id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM trips WHERE id = ?1", rusqlite::params![id])?)
            })
            .await?;
        Ok(n > 0)
    }
}

// ---------------------------------------------------------------------------
// Shared SQL helpers
// ---------------------------------------------------------------------------

pub(super) fn load_trip(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Trip>> {
    let sql = format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?1");
    conn.query_row(&sql, rusqlite::params![id], row_to_trip)
        .optional()
}

fn write_trip(conn: &rusqlite::Connection, trip: &Trip, insert: bool) -> rusqlite::Result<()> {
    let sql = if insert {
        "INSERT INTO trips (id, owner_phone, manager_phone, destination, hotel,
            departure_date, return_date, adults, children, price, paid_amount, status,
            cashback_percent, cashback_status, referral_status, notes, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)"
    } else {
        "UPDATE trips SET owner_phone=?2, manager_phone=?3, destination=?4, hotel=?5,
            departure_date=?6, return_date=?7, adults=?8, children=?9, price=?10,
            paid_amount=?11, status=?12, cashback_percent=?13, cashback_status=?14,
            referral_status=?15, notes=?16, created_at=?17, updated_at=?18
         WHERE id = ?1"
    };
    conn.execute(
        sql,
        rusqlite::params![
            trip.id.to_string(),
            trip.owner_phone,
            trip.manager_phone,
            trip.destination,
            trip.hotel,
            trip.departure_date.to_string(),
            trip.return_date.to_string(),
            trip.adults,
            trip.children,
            trip.price,
            trip.paid_amount,
            enum_to_sql(&trip.status),
            trip.cashback_percent,
            enum_to_sql(&trip.cashback_status),
            enum_to_sql(&trip.referral_status),
            trip.notes,
            ts(&trip.created_at),
            ts(&trip.updated_at),
        ],
    )?;
    Ok(())
}

/// Claim a `paid` trip as `completed` and queue whichever payouts apply.
/// Returns `None` when the trip was not in `paid` any more, otherwise whether
/// cashback and referral payouts were queued.
pub(super) fn complete_in_tx(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    now: &str,
) -> rusqlite::Result<Option<(bool, bool)>> {
    let changed = tx.execute(
        "UPDATE trips SET status = 'completed', updated_at = ?2 WHERE id = ?1 AND status = 'paid'",
        rusqlite::params![id, now],
    )?;
    if changed != 1 {
        return Ok(None);
    }
    let cashback = tx.execute(
        "UPDATE trips SET cashback_status = 'pending'
         WHERE id = ?1 AND cashback_status = 'none'
           AND cashback_percent > 0 AND paid_amount > 0",
        rusqlite::params![id],
    )? == 1;
    let referral = tx.execute(
        "UPDATE trips SET referral_status = 'pending'
         WHERE id = ?1 AND referral_status = 'none' AND paid_amount > 0
           AND EXISTS (SELECT 1 FROM users u
                       WHERE u.phone = trips.owner_phone AND u.referred_by IS NOT NULL)",
        rusqlite::params![id],
    )? == 1;
    Ok(Some((cashback, referral)))
}

pub(super) fn row_to_trip(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trip> {
    let id: String = row.get(0)?;
    let departure: String = row.get(5)?;
    let return_date: String = row.get(6)?;
    let status: String = row.get(11)?;
    let cashback_status: String = row.get(13)?;
    let referral_status: String = row.get(14)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    Ok(Trip {
        id: parse_uuid(0, &id)?,
        owner_phone: row.get(1)?,
        manager_phone: row.get(2)?,
        destination: row.get(3)?,
        hotel: row.get(4)?,
        departure_date: parse_date(5, &departure)?,
        return_date: parse_date(6, &return_date)?,
        adults: row.get(7)?,
        children: row.get(8)?,
        price: row.get(9)?,
        paid_amount: row.get(10)?,
        status: enum_from_sql(11, &status)?,
        cashback_percent: row.get(12)?,
        cashback_status: enum_from_sql::<PayoutStatus>(13, &cashback_status)?,
        referral_status: enum_from_sql::<PayoutStatus>(14, &referral_status)?,
        notes: row.get(15)?,
        created_at: parse_ts(16, &created_at)?,
        updated_at: parse_ts(17, &updated_at)?,
    })
}
