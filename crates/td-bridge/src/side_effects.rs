//! Notifications, audit entries and SMS that accompany a primary action.
//!
//! None of these may fail the request that triggered them: errors are logged
//! at `warn` and dropped.

use std::sync::Arc;

use td_core::store::Store;
use td_core::types::{AuditLog, Notification, NotificationKind, Privilege};
use td_core::validation::mask_phone;
use td_integrations::sms::SmsSender;
use tracing::{debug, warn};
use uuid::Uuid;

pub async fn notify(store: &Store, notification: Notification) {
    let user_id = notification.user_id;
    if let Err(e) = store.insert_notification(&notification).await {
        warn!(error = %e, %user_id, "failed to store notification");
    }
}

/// Notify the account registered under `phone`, if any.
pub async fn notify_phone(
    store: &Store,
    phone: &str,
    kind: NotificationKind,
    title: &str,
    message: &str,
) {
    match store.get_user_by_phone(phone).await {
        Ok(Some(user)) => notify(store, Notification::new(user.id, kind, title, message)).await,
        Ok(None) => debug!(phone = %mask_phone(phone), "no account to notify"),
        Err(e) => warn!(error = %e, "failed to look up notification recipient"),
    }
}

/// One notification per manager and admin.
pub async fn notify_staff(store: &Store, kind: NotificationKind, title: &str, message: &str) {
    let staff = match store.list_staff(Privilege::Manager).await {
        Ok(staff) => staff,
        Err(e) => {
            warn!(error = %e, "failed to list staff for notification");
            return;
        }
    };
    let batch: Vec<Notification> = staff
        .iter()
        .map(|u| Notification::new(u.id, kind, title, message))
        .collect();
    if batch.is_empty() {
        return;
    }
    if let Err(e) = store.insert_notifications(&batch).await {
        warn!(error = %e, recipients = batch.len(), "failed to store staff notifications");
    }
}

pub async fn audit(
    store: &Store,
    actor_id: Uuid,
    action: &str,
    entity: &str,
    entity_id: impl ToString,
    details: serde_json::Value,
) {
    let entry = AuditLog::new(
        Some(actor_id),
        action,
        entity,
        Some(entity_id.to_string()),
        details,
    );
    if let Err(e) = store.insert_audit_log(&entry).await {
        warn!(error = %e, action, entity, "failed to write audit log");
    }
}

/// Returns whether the message was handed to the gateway.
pub async fn send_sms(sms: Option<&Arc<dyn SmsSender>>, to: &str, text: &str) -> bool {
    let Some(sms) = sms else {
        warn!(to = %mask_phone(to), "SMS gateway not configured, message dropped");
        return false;
    };
    match sms.send(to, text).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, to = %mask_phone(to), "failed to send SMS");
            false
        }
    }
}

/// Minor units as `major.minor`, e.g. `150050` -> `1500.50`.
pub fn money(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_integrations::sms::MockSms;

    #[test]
    fn money_formats_minor_units() {
        assert_eq!(money(150050), "1500.50");
        assert_eq!(money(7), "0.07");
        assert_eq!(money(-2500), "-25.00");
    }

    #[tokio::test]
    async fn sms_failures_are_swallowed() {
        let failing: Arc<dyn SmsSender> = Arc::new(MockSms::failing());
        assert!(!send_sms(Some(&failing), "+79990000000", "hi").await);
        assert!(!send_sms(None, "+79990000000", "hi").await);

        let mock = Arc::new(MockSms::new());
        let sender: Arc<dyn SmsSender> = mock.clone();
        assert!(send_sms(Some(&sender), "+79990000000", "hi").await);
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test]
    async fn staff_notifications_skip_clients() {
        let store = Store::open_in_memory().await.unwrap();
        let client = td_core::types::User::new("+79990000001", "Client", "x", "REFCODE1");
        store.create_user(&client).await.unwrap();
        let manager = td_core::types::User::new("+79990000002", "Manager", "x", "REFCODE2");
        store.create_user(&manager).await.unwrap();
        store.set_privilege(manager.id, Privilege::Manager).await.unwrap();

        notify_staff(&store, NotificationKind::Contact, "New request", "Call back").await;

        assert_eq!(store.notification_counts(manager.id).await.unwrap().unread, 1);
        assert_eq!(store.notification_counts(client.id).await.unwrap().total, 0);
    }
}
