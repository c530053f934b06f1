use serde::Serialize;
use uuid::Uuid;

use super::{enum_from_sql, enum_to_sql, page, parse_opt_uuid, parse_ts, parse_uuid, ts};
use super::{Store, StoreError, StoreResult};
use crate::types::{AuditLog, Notification};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationCounts {
    pub total: u64,
    pub unread: u64,
}

impl Store {
    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    pub async fn insert_notification(&self, notification: &Notification) -> StoreResult<()> {
        self.insert_notifications(std::slice::from_ref(notification))
            .await
    }

    /// Insert a batch atomically, e.g. one notification per manager.
    pub async fn insert_notifications(&self, batch: &[Notification]) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch = batch.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO notifications (id, user_id, kind, title, message, read,
                            created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )?;
                    for n in &batch {
                        stmt.execute(rusqlite::params![
                            n.id.to_string(),
                            n.user_id.to_string(),
                            enum_to_sql(&n.kind),
                            n.title,
                            n.message,
                            n.read,
                            ts(&n.created_at),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<Notification>> {
        let user_id = user_id.to_string();
        let (limit, offset) = page(limit, offset);
        let list = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, kind, title, message, read, created_at
                     FROM notifications
                     WHERE user_id = ?1 AND (?2 = 0 OR read = 0)
                     ORDER BY created_at DESC LIMIT ?3 OFFSET ?4",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_id, unread_only, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_notification(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(list)
    }

    pub async fn notification_counts(&self, user_id: Uuid) -> StoreResult<NotificationCounts> {
        let user_id = user_id.to_string();
        let counts = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(CASE WHEN read = 0 THEN 1 ELSE 0 END), 0)
                     FROM notifications WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| {
                        Ok(NotificationCounts {
                            total: row.get::<_, i64>(0)? as u64,
                            unread: row.get::<_, i64>(1)? as u64,
                        })
                    },
                )?)
            })
            .await?;
        Ok(counts)
    }

    /// Mark one of the user's notifications read. `NotFound` if it does not
    /// exist or belongs to someone else.
    pub async fn mark_notification_read(&self, id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
                    rusqlite::params![id, user_id],
                )?)
            })
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound("notification".into()));
        }
        Ok(())
    }

    pub async fn mark_all_notifications_read(&self, user_id: Uuid) -> StoreResult<usize> {
        let user_id = user_id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0",
                    rusqlite::params![user_id],
                )?)
            })
            .await?;
        Ok(n)
    }

    pub async fn delete_notification(&self, id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
                    rusqlite::params![id, user_id],
                )?)
            })
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound("notification".into()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    pub async fn insert_audit_log(&self, entry: &AuditLog) -> StoreResult<()> {
        let e = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_logs (id, actor_id, action, entity, entity_id, details,
                        created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        e.id.to_string(),
                        e.actor_id.map(|u| u.to_string()),
                        e.action,
                        e.entity,
                        e.entity_id,
                        e.details.to_string(),
                        ts(&e.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_audit_logs(
        &self,
        entity: Option<String>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<AuditLog>> {
        let (limit, offset) = page(limit, offset);
        let logs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, actor_id, action, entity, entity_id, details, created_at
                     FROM audit_logs
                     WHERE (?1 IS NULL OR entity = ?1)
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![entity, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_audit(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(logs)
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    Ok(Notification {
        id: parse_uuid(0, &id)?,
        user_id: parse_uuid(1, &user_id)?,
        kind: enum_from_sql(2, &kind)?,
        title: row.get(3)?,
        message: row.get(4)?,
        read: row.get(5)?,
        created_at: parse_ts(6, &created_at)?,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLog> {
    let id: String = row.get(0)?;
    let actor_id: Option<String> = row.get(1)?;
    let details: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(AuditLog {
        id: parse_uuid(0, &id)?,
        actor_id: parse_opt_uuid(1, actor_id)?,
        action: row.get(2)?,
        entity: row.get(3)?,
        entity_id: row.get(4)?,
        details: serde_json::from_str(&details).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_ts(6, &created_at)?,
    })
}
