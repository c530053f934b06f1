use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use td_bridge::http_api::ApiState;
use td_core::config::Config;
use td_core::crypto::OtpKey;
use td_core::store::{Store, TripUpdate};
use td_core::types::{PayoutStatus, Trip, TripStatus, User};
use td_daemon::daemon::Daemon;
use td_daemon::scheduler::{CronScheduler, LimiterSweeper};
use td_harness::rate_limiter::{RateLimitRule, RateLimiter};
use td_harness::shutdown::ShutdownSignal;

async fn memory_state() -> Arc<ApiState> {
    let store = Arc::new(Store::open_in_memory().await.expect("in-memory store"));
    Arc::new(ApiState::new(
        Config::default(),
        store,
        OtpKey::ephemeral().expect("otp key"),
    ))
}

async fn seed_finished_trip(state: &ApiState) -> (User, Trip) {
    let owner = User::new("+79995550001", "Traveller", "x", "RTRAVEL1");
    state.store.create_user(&owner).await.expect("create user");

    let back = Utc::now().date_naive() - chrono::Duration::days(1);
    let mut trip = Trip::new(&owner.phone, "Sochi", back - chrono::Duration::days(5), back, 50_000);
    trip.cashback_percent = 4.0;
    state.store.create_trip(&trip).await.expect("create trip");
    let paid = TripUpdate {
        paid_amount: Some(50_000),
        ..Default::default()
    };
    state.store.update_trip(trip.id, paid).await.expect("update trip");
    state
        .store
        .set_trip_status(trip.id, TripStatus::Confirmed)
        .await
        .expect("confirm");
    state
        .store
        .set_trip_status(trip.id, TripStatus::Paid)
        .await
        .expect("pay");
    (owner, trip)
}

#[tokio::test]
async fn daemon_serves_api_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("data").join("tourdesk.db");
    let mut config = Config::default();
    config.database.path = db_path.to_string_lossy().into_owned();

    let daemon = Arc::new(Daemon::new(config).await.expect("daemon"));
    let shutdown = daemon.shutdown_handle();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };

    let resp = reqwest::get(format!("http://{addr}/api/health")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(db_path.exists(), "database file created under a new directory");

    shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops after shutdown")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn scheduler_runs_cron_jobs_on_interval() {
    let state = memory_state().await;
    let (owner, trip) = seed_finished_trip(&state).await;

    let shutdown = ShutdownSignal::new();
    let scheduler = CronScheduler::new(state.clone(), Duration::from_millis(20));
    let handle = tokio::spawn(scheduler.run(shutdown.clone()));

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stored = state.store.get_trip(trip.id).await.unwrap().unwrap();
            if stored.cashback_status == PayoutStatus::Credited {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cashback credited by the scheduler");
    assert_eq!(completed.status, TripStatus::Completed);

    // Later passes must not pay again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let owner = state.store.get_user(owner.id).await.unwrap().unwrap();
    assert_eq!(owner.cashback_balance, 2_000);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scheduler stops")
        .unwrap();
}

#[tokio::test]
async fn scheduler_stops_before_first_tick() {
    let state = memory_state().await;
    let shutdown = ShutdownSignal::new();
    let handle = tokio::spawn(
        CronScheduler::new(state, Duration::from_secs(3600)).run(shutdown.clone()),
    );

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scheduler stops without waiting for the interval")
        .unwrap();
}

#[tokio::test]
async fn single_tick_on_quiet_store_sends_nothing() {
    let state = memory_state().await;
    let user = User::new("+79995550002", "Idle", "x", "RIDLE001");
    state.store.create_user(&user).await.unwrap();

    CronScheduler::from_config(state.clone()).tick().await;

    let counts = state.store.notification_counts(user.id).await.unwrap();
    assert_eq!(counts.total, 0);
}

fn short_window_limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new().with_rule("login", RateLimitRule::new(5, Duration::from_millis(30))))
}

async fn wait_until_empty(limiter: &RateLimiter) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while limiter.tracked_keys() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle windows swept");
}

#[tokio::test]
async fn sweeper_drops_idle_windows_and_stops_on_shutdown() {
    let limiter = short_window_limiter();
    for ip in ["192.0.2.1", "192.0.2.2", "192.0.2.3"] {
        limiter.check("login", ip).unwrap();
    }
    assert_eq!(limiter.tracked_keys(), 3);

    let shutdown = ShutdownSignal::new();
    let handle = tokio::spawn(
        LimiterSweeper::new(limiter.clone(), Duration::from_millis(20)).run(shutdown.clone()),
    );
    wait_until_empty(&limiter).await;

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sweeper stops")
        .unwrap();
}

#[tokio::test]
async fn daemon_sweeps_limiter_with_cron_disabled() {
    let limiter = short_window_limiter();
    let store = Arc::new(Store::open_in_memory().await.expect("in-memory store"));
    let config = Config::default();
    assert!(!config.cron.enabled);
    let state = ApiState::new(config.clone(), store, OtpKey::ephemeral().expect("otp key"))
        .with_limiter(limiter.clone());

    let daemon = Arc::new(
        Daemon::with_state(config, Arc::new(state)).with_sweep_interval(Duration::from_millis(20)),
    );
    let shutdown = daemon.shutdown_handle();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };

    limiter.check("login", "192.0.2.20").unwrap();
    limiter.check("login", "phone:+79995550003").unwrap();
    wait_until_empty(&limiter).await;

    shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("daemon stops after shutdown")
        .unwrap();
    assert!(result.is_ok());
}
