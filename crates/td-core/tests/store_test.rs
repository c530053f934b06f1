use chrono::{Duration, NaiveDate, Utc};
use td_core::store::{
    ArticleUpdate, ContactFilter, LedgerEntry, Store, StoreError, TripFilter, TripUpdate,
    UserFilter,
};
use td_core::types::*;
use uuid::Uuid;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn user(db: &Store, phone: &str, code: &str) -> User {
    let u = User::new(phone, "Test User", "pbkdf2-sha256$1$00$00", code);
    db.create_user(&u).await.unwrap();
    u
}

/// A paid trip that returned on 2026-06-10.
async fn paid_trip(db: &Store, owner_phone: &str, paid: i64, percent: f64) -> Trip {
    let mut trip = Trip::new(owner_phone, "Antalya", date(2026, 6, 1), date(2026, 6, 10), paid);
    trip.paid_amount = paid;
    trip.cashback_percent = percent;
    db.create_trip(&trip).await.unwrap();
    db.set_trip_status(trip.id, TripStatus::Confirmed).await.unwrap();
    db.set_trip_status(trip.id, TripStatus::Paid).await.unwrap()
}

// ---------------------------------------------------------------------------
// Users and sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_create_and_lookup() {
    let db = Store::open_in_memory().await.unwrap();
    let u = user(&db, "+79990000001", "AAAA2222").await;

    let by_id = db.get_user(u.id).await.unwrap().expect("user exists");
    assert_eq!(by_id.phone, "+79990000001");
    assert_eq!(by_id.privilege, Privilege::Client);
    assert!(!by_id.phone_verified);

    let by_phone = db.get_user_by_phone("+79990000001").await.unwrap().unwrap();
    assert_eq!(by_phone.id, u.id);
    let by_code = db.get_user_by_referral_code("aaaa2222").await.unwrap().unwrap();
    assert_eq!(by_code.id, u.id);
    assert!(db.get_user(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_phone_is_conflict() {
    let db = Store::open_in_memory().await.unwrap();
    user(&db, "+79990000001", "AAAA2222").await;
    let dup = User::new("+79990000001", "Other", "x", "BBBB3333");
    assert!(matches!(
        db.create_user(&dup).await,
        Err(StoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn user_updates_and_search() {
    let db = Store::open_in_memory().await.unwrap();
    let anna = user(&db, "+79990000001", "AAAA2222").await;
    user(&db, "+79990000002", "BBBB3333").await;

    db.mark_phone_verified(anna.id).await.unwrap();
    db.set_privilege(anna.id, Privilege::Manager).await.unwrap();
    db.set_password_hash(anna.id, "new-hash").await.unwrap();
    let updated = db
        .update_profile(anna.id, Some("Anna K".into()), Some("anna@example.com".into()))
        .await
        .unwrap();
    assert_eq!(updated.name, "Anna K");
    assert_eq!(updated.email.as_deref(), Some("anna@example.com"));
    assert!(updated.phone_verified);
    assert_eq!(updated.privilege, Privilege::Manager);
    assert_eq!(updated.password_hash, "new-hash");

    let found = db
        .list_users(&UserFilter {
            search: Some("0001".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, anna.id);

    let staff = db.list_staff(Privilege::Manager).await.unwrap();
    assert_eq!(staff.len(), 1);

    assert!(matches!(
        db.mark_phone_verified(Uuid::new_v4()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn sessions_expire_and_revoke() {
    let db = Store::open_in_memory().await.unwrap();
    let u = user(&db, "+79990000001", "AAAA2222").await;
    let now = Utc::now();

    for (hash, ttl) in [("live", 1), ("stale", -1)] {
        db.create_session(&Session {
            token_hash: hash.into(),
            user_id: u.id,
            created_at: now,
            expires_at: now + Duration::hours(ttl),
        })
        .await
        .unwrap();
    }

    assert_eq!(db.resolve_session("live", now).await.unwrap().unwrap().id, u.id);
    assert!(db.resolve_session("stale", now).await.unwrap().is_none());
    assert!(db.resolve_session("missing", now).await.unwrap().is_none());

    assert_eq!(db.purge_expired_sessions(now).await.unwrap(), 1);
    assert_eq!(db.delete_user_sessions(u.id).await.unwrap(), 1);
    assert!(db.resolve_session("live", now).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trip_lifecycle_is_validated() {
    let db = Store::open_in_memory().await.unwrap();
    let trip = Trip::new("+79990000001", "Sochi", date(2026, 7, 1), date(2026, 7, 8), 50_000);
    db.create_trip(&trip).await.unwrap();

    let err = db.set_trip_status(trip.id, TripStatus::Paid).await;
    assert!(matches!(err, Err(StoreError::Invalid(_))));

    db.set_trip_status(trip.id, TripStatus::Cancelled).await.unwrap();
    let err = db.set_trip_status(trip.id, TripStatus::Confirmed).await;
    assert!(matches!(err, Err(StoreError::Invalid(_))));

    let err = db.set_trip_status(Uuid::new_v4(), TripStatus::Confirmed).await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn trip_update_and_filter() {
    let db = Store::open_in_memory().await.unwrap();
    let a = Trip::new("+79990000001", "Sochi", date(2026, 7, 1), date(2026, 7, 8), 50_000);
    let b = Trip::new("+79990000002", "Kazan", date(2026, 8, 1), date(2026, 8, 3), 20_000);
    db.create_trip(&a).await.unwrap();
    db.create_trip(&b).await.unwrap();

    let updated = db
        .update_trip(
            a.id,
            TripUpdate {
                hotel: Some("Radisson".into()),
                manager_phone: Some("+79995550000".into()),
                adults: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.hotel.as_deref(), Some("Radisson"));
    assert_eq!(updated.adults, 2);

    let bad = db
        .update_trip(
            a.id,
            TripUpdate {
                return_date: Some(date(2026, 6, 1)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(bad, Err(StoreError::Invalid(_))));

    let mine = db
        .list_trips(&TripFilter {
            owner_phone: Some("+79990000001".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);

    let managed = db
        .list_trips(&TripFilter {
            manager_phone: Some("+79995550000".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(managed[0].id, a.id);

    let all = db.list_trips(&TripFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, b.id, "latest departure first");

    assert!(db.delete_trip(b.id).await.unwrap());
    assert!(!db.delete_trip(b.id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Cashback ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finished_trips_complete_and_credit_once() {
    let db = Store::open_in_memory().await.unwrap();
    let referrer = user(&db, "+79990000009", "REFR2222").await;
    let mut owner = User::new("+79990000001", "Owner", "x", "OWNR3333");
    owner.referred_by = Some(referrer.id);
    db.create_user(&owner).await.unwrap();

    let trip = paid_trip(&db, &owner.phone, 100_000, 3.0).await;

    // Not finished yet on the return date itself.
    assert!(db
        .complete_finished_trips(date(2026, 6, 10))
        .await
        .unwrap()
        .is_empty());

    let done = db.complete_finished_trips(date(2026, 6, 11)).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, TripStatus::Completed);
    assert_eq!(done[0].cashback_status, PayoutStatus::Pending);
    assert_eq!(done[0].referral_status, PayoutStatus::Pending);
    assert!(db
        .complete_finished_trips(date(2026, 6, 11))
        .await
        .unwrap()
        .is_empty());

    let awaiting = db.list_trips_awaiting_cashback().await.unwrap();
    assert_eq!(awaiting.len(), 1);

    let credited = db.credit_trip_cashback(trip.id).await.unwrap().unwrap();
    assert_eq!(credited.amount, 3_000);
    assert_eq!(credited.balance_after, 3_000);
    assert_eq!(credited.kind, TransactionKind::TripCashback);
    assert!(db.credit_trip_cashback(trip.id).await.unwrap().is_none());

    let bonus = db.credit_referral_bonus(trip.id, 1.0).await.unwrap().unwrap();
    assert_eq!(bonus.user_id, referrer.id);
    assert_eq!(bonus.amount, 1_000);
    assert!(db.credit_referral_bonus(trip.id, 1.0).await.unwrap().is_none());

    let owner_now = db.get_user(owner.id).await.unwrap().unwrap();
    assert_eq!(owner_now.cashback_balance, 3_000);
    let referrer_now = db.get_user(referrer.id).await.unwrap().unwrap();
    assert_eq!(referrer_now.cashback_balance, 1_000);

    assert!(db.list_trips_awaiting_cashback().await.unwrap().is_empty());
    let ledger = db.list_transactions(owner.id, None, None).await.unwrap();
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn concurrent_credit_pays_exactly_once() {
    let db = std::sync::Arc::new(Store::open_in_memory().await.unwrap());
    let owner = user(&db, "+79990000001", "OWNR3333").await;
    let trip = paid_trip(&db, &owner.phone, 10_000, 10.0).await;
    db.complete_finished_trips(date(2026, 7, 1)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.credit_trip_cashback(trip.id).await.unwrap()
        }));
    }
    let mut paid = 0;
    for h in handles {
        if h.await.unwrap().is_some() {
            paid += 1;
        }
    }
    assert_eq!(paid, 1);
    let owner_now = db.get_user(owner.id).await.unwrap().unwrap();
    assert_eq!(owner_now.cashback_balance, 1_000);
}

#[tokio::test]
async fn trip_without_referrer_queues_only_cashback() {
    let db = Store::open_in_memory().await.unwrap();
    let owner = user(&db, "+79990000001", "OWNR3333").await;
    let trip = paid_trip(&db, &owner.phone, 10_000, 0.0).await;

    let done = db.set_trip_status(trip.id, TripStatus::Completed).await.unwrap();
    assert_eq!(done.cashback_status, PayoutStatus::None, "zero percent");
    assert_eq!(done.referral_status, PayoutStatus::None);
    assert!(db.list_trips_awaiting_cashback().await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_adjustment_cannot_go_negative() {
    let db = Store::open_in_memory().await.unwrap();
    let u = user(&db, "+79990000001", "AAAA2222").await;

    let tx = db
        .adjust_balance(LedgerEntry::new(u.id, 500, TransactionKind::ManualAdjustment))
        .await
        .unwrap();
    assert_eq!(tx.balance_after, 500);

    let err = db
        .adjust_balance(LedgerEntry::new(u.id, -501, TransactionKind::ManualAdjustment))
        .await;
    assert!(matches!(err, Err(StoreError::Invalid(_))));
    assert_eq!(db.get_user(u.id).await.unwrap().unwrap().cashback_balance, 500);
    assert_eq!(db.list_transactions(u.id, None, None).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Promo codes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn promo_codes_reserve_and_redeem() {
    let db = Store::open_in_memory().await.unwrap();
    let owner = user(&db, "+79990000001", "AAAA2222").await;
    let manager = user(&db, "+79990000002", "BBBB3333").await;
    db.adjust_balance(LedgerEntry::new(owner.id, 1_000, TransactionKind::ManualAdjustment))
        .await
        .unwrap();

    let ttl = Duration::days(30);
    let promo = db.create_promo_code(owner.id, 600, 100, ttl).await.unwrap();
    assert_eq!(promo.code.len(), 8);
    assert_eq!(promo.status, PromoStatus::Active);

    // 600 of 1000 is reserved by the active code.
    let over = db.create_promo_code(owner.id, 500, 100, ttl).await;
    assert!(matches!(over, Err(StoreError::Invalid(_))));
    let tiny = db.create_promo_code(owner.id, 50, 100, ttl).await;
    assert!(matches!(tiny, Err(StoreError::Invalid(_))));

    let (redeemed, tx) = db
        .redeem_promo_code(&promo.code.to_lowercase(), manager.id, None, Utc::now())
        .await
        .unwrap();
    assert_eq!(redeemed.status, PromoStatus::Redeemed);
    assert_eq!(redeemed.redeemed_by, Some(manager.id));
    assert_eq!(tx.amount, -600);
    assert_eq!(tx.balance_after, 400);
    assert_eq!(tx.promo_code_id, Some(promo.id));

    let again = db
        .redeem_promo_code(&promo.code, manager.id, None, Utc::now())
        .await;
    assert!(matches!(again, Err(StoreError::Conflict(_))));

    let listed = db.list_promo_codes(Some(owner.id), None, None).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn promo_cancel_and_expire() {
    let db = Store::open_in_memory().await.unwrap();
    let owner = user(&db, "+79990000001", "AAAA2222").await;
    db.adjust_balance(LedgerEntry::new(owner.id, 1_000, TransactionKind::ManualAdjustment))
        .await
        .unwrap();

    let a = db
        .create_promo_code(owner.id, 300, 100, Duration::days(1))
        .await
        .unwrap();
    let b = db
        .create_promo_code(owner.id, 300, 100, Duration::days(1))
        .await
        .unwrap();

    let cancelled = db.cancel_promo_code(a.id).await.unwrap();
    assert_eq!(cancelled.status, PromoStatus::Cancelled);
    assert!(matches!(
        db.cancel_promo_code(a.id).await,
        Err(StoreError::Conflict(_))
    ));
    let redeem_cancelled = db
        .redeem_promo_code(&a.code, owner.id, None, Utc::now())
        .await;
    assert!(matches!(redeem_cancelled, Err(StoreError::Invalid(_))));

    let later = Utc::now() + Duration::days(2);
    let late = db.redeem_promo_code(&b.code, owner.id, None, later).await;
    assert!(matches!(late, Err(StoreError::Invalid(_))));

    assert_eq!(db.expire_promo_codes(later).await.unwrap(), 1);
    assert_eq!(db.expire_promo_codes(later).await.unwrap(), 0);
    let b_now = db.get_promo_code(&b.code).await.unwrap().unwrap();
    assert_eq!(b_now.status, PromoStatus::Expired);
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

fn article(slug: &str, published: bool) -> Article {
    let now = Utc::now();
    Article {
        id: Uuid::new_v4(),
        slug: slug.into(),
        title: "Title".into(),
        summary: "Summary".into(),
        body: "Body".into(),
        cover_image_url: None,
        published,
        published_at: published.then_some(now),
        author_id: Uuid::new_v4(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn articles_crud() {
    let db = Store::open_in_memory().await.unwrap();
    let draft = article("winter-in-dubai", false);
    let live = article("summer-in-crete", true);
    db.create_article(&draft).await.unwrap();
    db.create_article(&live).await.unwrap();
    assert!(matches!(
        db.create_article(&article("summer-in-crete", true)).await,
        Err(StoreError::Conflict(_))
    ));

    assert_eq!(db.list_articles(true, None, None).await.unwrap().len(), 1);
    assert_eq!(db.list_articles(false, None, None).await.unwrap().len(), 2);

    let published = db
        .update_article(
            draft.id,
            ArticleUpdate {
                published: Some(true),
                title: Some("Winter in Dubai".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(published.published);
    assert!(published.published_at.is_some());

    let clash = db
        .update_article(
            draft.id,
            ArticleUpdate {
                slug: Some("summer-in-crete".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(clash, Err(StoreError::Conflict(_))));

    let by_slug = db.get_article_by_slug("winter-in-dubai").await.unwrap().unwrap();
    assert_eq!(by_slug.title, "Winter in Dubai");
    assert!(db.delete_article(draft.id).await.unwrap());
    assert!(db.get_article(draft.id).await.unwrap().is_none());
}

#[tokio::test]
async fn contact_requests_flow() {
    let db = Store::open_in_memory().await.unwrap();
    let req = ContactRequest {
        id: Uuid::new_v4(),
        name: "Ivan".into(),
        phone: "+79990000001".into(),
        message: "Call me about Bali".into(),
        preferred_date: Some(date(2026, 9, 1)),
        handled: false,
        handled_by: None,
        created_at: Utc::now(),
    };
    db.create_contact_request(&req).await.unwrap();

    let open = db
        .list_contact_requests(&ContactFilter {
            handled: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].preferred_date, Some(date(2026, 9, 1)));

    let manager = Uuid::new_v4();
    let handled = db.mark_contact_handled(req.id, manager).await.unwrap();
    assert!(handled.handled);
    let twice = db.mark_contact_handled(req.id, Uuid::new_v4()).await.unwrap();
    assert_eq!(twice.handled_by, Some(manager));
}

// ---------------------------------------------------------------------------
// Notifications and audit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notifications_are_scoped_to_owner() {
    let db = Store::open_in_memory().await.unwrap();
    let a = user(&db, "+79990000001", "AAAA2222").await;
    let b = user(&db, "+79990000002", "BBBB3333").await;

    let n1 = Notification::new(a.id, NotificationKind::Info, "Hi", "one");
    let n2 = Notification::new(a.id, NotificationKind::Cashback, "Cashback", "two");
    db.insert_notifications(&[n1.clone(), n2.clone()]).await.unwrap();

    let counts = db.notification_counts(a.id).await.unwrap();
    assert_eq!((counts.total, counts.unread), (2, 2));

    assert!(matches!(
        db.mark_notification_read(n1.id, b.id).await,
        Err(StoreError::NotFound(_))
    ));
    db.mark_notification_read(n1.id, a.id).await.unwrap();
    let unread = db.list_notifications(a.id, true, None, None).await.unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, n2.id);

    assert_eq!(db.mark_all_notifications_read(a.id).await.unwrap(), 1);
    assert!(matches!(
        db.delete_notification(n2.id, b.id).await,
        Err(StoreError::NotFound(_))
    ));
    db.delete_notification(n2.id, a.id).await.unwrap();
    let counts = db.notification_counts(a.id).await.unwrap();
    assert_eq!((counts.total, counts.unread), (1, 0));
}

#[tokio::test]
async fn audit_log_filters_by_entity() {
    let db = Store::open_in_memory().await.unwrap();
    let actor = Some(Uuid::new_v4());
    db.insert_audit_log(&AuditLog::new(
        actor,
        "trip.status",
        "trip",
        Some("t1".into()),
        serde_json::json!({"to": "paid"}),
    ))
    .await
    .unwrap();
    db.insert_audit_log(&AuditLog::new(
        actor,
        "article.create",
        "article",
        None,
        serde_json::json!({}),
    ))
    .await
    .unwrap();

    let trips = db
        .list_audit_logs(Some("trip".into()), None, None)
        .await
        .unwrap();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].details["to"], "paid");
    assert_eq!(db.list_audit_logs(None, None, None).await.unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// On-disk
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_database_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("tourdesk.db");
    let id = {
        let db = Store::open(&path).await.unwrap();
        user(&db, "+79990000001", "AAAA2222").await.id
    };
    let db = Store::open(&path).await.unwrap();
    assert!(db.get_user(id).await.unwrap().is_some());
}
