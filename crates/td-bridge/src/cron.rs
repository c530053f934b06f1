//! Scheduled jobs. Exposed as `/api/cron/*` for an external scheduler and run
//! in-process by the daemon; both paths go through these functions.
//!
//! Every job is idempotent: the store claims rows with conditional updates,
//! so a second run right after a successful one reports zero work.

use chrono::Utc;
use serde::Serialize;
use td_core::store::StoreResult;
use td_core::types::{Notification, NotificationKind, PayoutStatus, Trip};
use tracing::{info, warn};

use crate::http_api::ApiState;
use crate::side_effects::{money, notify, notify_phone};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompleteTripsReport {
    pub completed: usize,
    pub cashback_queued: usize,
    pub referral_queued: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreditReport {
    pub cashback_credited: usize,
    pub cashback_total: i64,
    pub referral_credited: usize,
    pub referral_total: i64,
    /// Payouts whose claim failed with an error; retried on the next run.
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpireReport {
    pub expired: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions_purged: usize,
    pub otp_codes_purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CronReport {
    pub complete_trips: CompleteTripsReport,
    pub credit_cashback: CreditReport,
    pub expire_promo_codes: ExpireReport,
    pub cleanup: CleanupReport,
}

/// Move paid trips whose return date has passed to `completed`.
pub async fn complete_trips(state: &ApiState) -> StoreResult<CompleteTripsReport> {
    let today = Utc::now().date_naive();
    let trips = state.store.complete_finished_trips(today).await?;

    let mut report = CompleteTripsReport {
        completed: trips.len(),
        ..Default::default()
    };
    for trip in &trips {
        if trip.cashback_status == PayoutStatus::Pending {
            report.cashback_queued += 1;
        }
        if trip.referral_status == PayoutStatus::Pending {
            report.referral_queued += 1;
        }
        notify_phone(
            &state.store,
            &trip.owner_phone,
            NotificationKind::TripUpdate,
            "Trip completed",
            &completion_message(trip),
        )
        .await;
    }
    if report.completed > 0 {
        info!(
            completed = report.completed,
            cashback_queued = report.cashback_queued,
            referral_queued = report.referral_queued,
            "completed finished trips"
        );
    }
    Ok(report)
}

fn completion_message(trip: &Trip) -> String {
    let mut message = format!("Welcome back from {}!", trip.destination);
    if trip.cashback_status == PayoutStatus::Pending {
        message.push_str(" Your cashback is on its way.");
    }
    message
}

/// Credit every pending cashback and referral payout.
///
/// A failure on one trip is logged and counted; the others still run.
pub async fn credit_cashback(state: &ApiState) -> StoreResult<CreditReport> {
    let trips = state.store.list_trips_awaiting_cashback().await?;
    let referral_percent = state.config.cashback.referral_percent;
    let mut report = CreditReport::default();

    for trip in trips {
        if trip.cashback_status == PayoutStatus::Pending {
            match state.store.credit_trip_cashback(trip.id).await {
                Ok(Some(tx)) => {
                    report.cashback_credited += 1;
                    report.cashback_total += tx.amount;
                    let note = Notification::new(
                        tx.user_id,
                        NotificationKind::Cashback,
                        "Cashback credited",
                        format!(
                            "{} cashback for your trip to {} was added to your balance.",
                            money(tx.amount),
                            trip.destination
                        ),
                    );
                    notify(&state.store, note).await;
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, trip_id = %trip.id, "cashback credit failed");
                }
            }
        }

        if trip.referral_status == PayoutStatus::Pending {
            match state
                .store
                .credit_referral_bonus(trip.id, referral_percent)
                .await
            {
                Ok(Some(tx)) => {
                    report.referral_credited += 1;
                    report.referral_total += tx.amount;
                    let note = Notification::new(
                        tx.user_id,
                        NotificationKind::Cashback,
                        "Referral bonus",
                        format!(
                            "{} bonus for a trip booked by a friend you invited.",
                            money(tx.amount)
                        ),
                    );
                    notify(&state.store, note).await;
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, trip_id = %trip.id, "referral credit failed");
                }
            }
        }
    }

    if report.cashback_credited + report.referral_credited + report.failed > 0 {
        info!(
            cashback_credited = report.cashback_credited,
            cashback_total = report.cashback_total,
            referral_credited = report.referral_credited,
            referral_total = report.referral_total,
            failed = report.failed,
            "credited trip payouts"
        );
    }
    Ok(report)
}

pub async fn expire_promo_codes(state: &ApiState) -> StoreResult<ExpireReport> {
    let expired = state.store.expire_promo_codes(Utc::now()).await?;
    if expired > 0 {
        info!(expired, "expired promo codes");
    }
    Ok(ExpireReport { expired })
}

pub async fn cleanup(state: &ApiState) -> StoreResult<CleanupReport> {
    let now = Utc::now();
    let report = CleanupReport {
        sessions_purged: state.store.purge_expired_sessions(now).await?,
        otp_codes_purged: state.store.purge_expired_otps(now).await?,
    };
    if report.sessions_purged + report.otp_codes_purged > 0 {
        info!(
            sessions = report.sessions_purged,
            otp_codes = report.otp_codes_purged,
            "purged expired credentials"
        );
    }
    Ok(report)
}

/// Every job in dependency order: completion queues payouts that the credit
/// step pays out in the same run.
pub async fn run_all(state: &ApiState) -> StoreResult<CronReport> {
    Ok(CronReport {
        complete_trips: complete_trips(state).await?,
        credit_cashback: credit_cashback(state).await?,
        expire_promo_codes: expire_promo_codes(state).await?,
        cleanup: cleanup(state).await?,
    })
}
