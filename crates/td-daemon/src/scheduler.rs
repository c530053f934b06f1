use std::sync::Arc;
use std::time::Duration;

use td_bridge::cron;
use td_bridge::http_api::ApiState;
use td_harness::rate_limiter::RateLimiter;
use td_harness::shutdown::ShutdownSignal;
use tracing::{debug, error, info};

/// How often idle rate-limit windows are dropped.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process cron: runs the same jobs as `/api/cron/*` on a fixed interval.
///
/// The HTTP triggers stay available alongside it. Jobs are idempotent, so an
/// external scheduler and this loop can overlap without double credits.
pub struct CronScheduler {
    state: Arc<ApiState>,
    interval: Duration,
}

impl CronScheduler {
    pub fn new(state: Arc<ApiState>, interval: Duration) -> Self {
        Self { state, interval }
    }

    pub fn from_config(state: Arc<ApiState>) -> Self {
        let secs = state.config.cron.interval_secs.max(1);
        Self::new(state, Duration::from_secs(secs))
    }

    /// One pass over every job. Failures are logged and the loop carries on.
    pub async fn tick(&self) {
        match cron::run_all(&self.state).await {
            Ok(report) => info!(
                completed = report.complete_trips.completed,
                cashback_credited = report.credit_cashback.cashback_credited,
                referral_credited = report.credit_cashback.referral_credited,
                promo_expired = report.expire_promo_codes.expired,
                sessions_purged = report.cleanup.sessions_purged,
                "cron pass completed"
            ),
            Err(e) => error!(error = %e, "cron pass failed"),
        }
    }

    /// Tick until `shutdown` fires. The first pass runs one interval after
    /// start, not immediately.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        info!(interval_secs = self.interval.as_secs(), "cron scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.wait() => {
                    info!("shutdown signal received, stopping cron scheduler");
                    break;
                }
            }
        }
    }
}

/// Periodically forgets rate-limit keys whose windows have emptied, so the
/// limiter map stays bounded whether or not in-process cron is enabled.
pub struct LimiterSweeper {
    limiter: Arc<RateLimiter>,
    interval: Duration,
}

impl LimiterSweeper {
    pub fn new(limiter: Arc<RateLimiter>, interval: Duration) -> Self {
        Self { limiter, interval }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let swept = self.limiter.sweep();
                    if swept > 0 {
                        debug!(swept, remaining = self.limiter.tracked_keys(), "rate limiter windows swept");
                    }
                }
                _ = shutdown.wait() => {
                    debug!("stopping rate limiter sweeper");
                    break;
                }
            }
        }
    }
}
