use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use super::{
    is_unique_violation, page, parse_opt_uuid, parse_ts, parse_uuid, ts, Store, StoreError,
    StoreResult,
};
use crate::types::{Privilege, User};

pub(super) const USER_COLUMNS: &str = "id, phone, name, email, password_hash, privilege, \
     phone_verified, cashback_balance, referral_code, referred_by, created_at, updated_at";

/// Search parameters for [`Store::list_users`].
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    /// Case-insensitive substring of phone or name.
    pub search: Option<String>,
    pub min_privilege: Option<Privilege>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Store {
    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Insert a new account. A taken phone or referral code is a `Conflict`.
    pub async fn create_user(&self, user: &User) -> StoreResult<()> {
        let user = user.clone();
        self.conn
            .call(move |conn| {
                let res = conn.execute(
                    "INSERT INTO users (id, phone, name, email, password_hash, privilege,
                        phone_verified, cashback_balance, referral_code, referred_by,
                        created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        user.id.to_string(),
                        user.phone,
                        user.name,
                        user.email,
                        user.password_hash,
                        user.privilege.level(),
                        user.phone_verified,
                        user.cashback_balance,
                        user.referral_code,
                        user.referred_by.map(|u| u.to_string()),
                        ts(&user.created_at),
                        ts(&user.updated_at),
                    ],
                );
                match res {
                    Ok(_) => Ok(Ok(())),
                    Err(e) if is_unique_violation(&e) => Ok(Err(StoreError::Conflict(
                        "phone number already registered".into(),
                    ))),
                    Err(e) => Err(e.into()),
                }
            })
            .await?
    }

    pub async fn get_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.find_user("id", id.to_string()).await
    }

    pub async fn get_user_by_phone(&self, phone: &str) -> StoreResult<Option<User>> {
        self.find_user("phone", phone.to_string()).await
    }

    pub async fn get_user_by_referral_code(&self, code: &str) -> StoreResult<Option<User>> {
        self.find_user("referral_code", code.trim().to_ascii_uppercase())
            .await
    }

    async fn find_user(&self, column: &'static str, value: String) -> StoreResult<Option<User>> {
        let user = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1");
                Ok(conn
                    .query_row(&sql, rusqlite::params![value], row_to_user)
                    .optional()?)
            })
            .await?;
        Ok(user)
    }

    pub async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<User>> {
        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.to_lowercase()));
        let min_privilege = filter.min_privilege.map(Privilege::level);
        let (limit, offset) = page(filter.limit, filter.offset);
        let users = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE (?1 IS NULL OR lower(phone) LIKE ?1 OR lower(name) LIKE ?1)
                       AND (?2 IS NULL OR privilege >= ?2)
                     ORDER BY created_at DESC
                     LIMIT ?3 OFFSET ?4"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows =
                    stmt.query(rusqlite::params![pattern, min_privilege, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_user(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(users)
    }

    /// Every user at or above `privilege`, unpaged. Used to fan out staff
    /// notifications.
    pub async fn list_staff(&self, privilege: Privilege) -> StoreResult<Vec<User>> {
        let level = privilege.level();
        let users = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE privilege >= ?1 ORDER BY created_at"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![level])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_user(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(users)
    }

    pub async fn mark_phone_verified(&self, id: Uuid) -> StoreResult<()> {
        self.update_user_column(id, "phone_verified", rusqlite::types::Value::Integer(1))
            .await
    }

    pub async fn set_password_hash(&self, id: Uuid, hash: &str) -> StoreResult<()> {
        self.update_user_column(
            id,
            "password_hash",
            rusqlite::types::Value::Text(hash.to_string()),
        )
        .await
    }

    pub async fn set_privilege(&self, id: Uuid, privilege: Privilege) -> StoreResult<()> {
        self.update_user_column(
            id,
            "privilege",
            rusqlite::types::Value::Integer(privilege.level()),
        )
        .await
    }

    async fn update_user_column(
        &self,
        id: Uuid,
        column: &'static str,
        value: rusqlite::types::Value,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let now = ts(&Utc::now());
        self.conn
            .call(move |conn| {
                let sql = format!("UPDATE users SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
                let changed = conn.execute(&sql, rusqlite::params![value, now, id])?;
                if changed == 1 {
                    Ok(Ok(()))
                } else {
                    Ok(Err(StoreError::NotFound("user".into())))
                }
            })
            .await?
    }

    /// Change display name and/or email. `Some("")` clears the email.
    pub async fn update_profile(
        &self,
        id: Uuid,
        name: Option<String>,
        email: Option<String>,
    ) -> StoreResult<User> {
        let id_str = id.to_string();
        let now = ts(&Utc::now());
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(name) = name {
                    tx.execute(
                        "UPDATE users SET name = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![name, now, id_str],
                    )?;
                }
                if let Some(email) = email {
                    let email = Some(email).filter(|e| !e.is_empty());
                    tx.execute(
                        "UPDATE users SET email = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![email, now, id_str],
                    )?;
                }
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
                let user = tx
                    .query_row(&sql, rusqlite::params![id_str], row_to_user)
                    .optional()?;
                match user {
                    Some(user) => {
                        tx.commit()?;
                        Ok(Ok(user))
                    }
                    None => Ok(Err(StoreError::NotFound("user".into()))),
                }
            })
            .await?
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

pub(super) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let privilege_level: i64 = row.get(5)?;
    let referred_by: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(User {
        id: parse_uuid(0, &id_str)?,
        phone: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        password_hash: row.get(4)?,
        privilege: Privilege::from_level(privilege_level).ok_or_else(|| {
            rusqlite::Error::IntegralValueOutOfRange(5, privilege_level)
        })?,
        phone_verified: row.get(6)?,
        cashback_balance: row.get(7)?,
        referral_code: row.get(8)?,
        referred_by: parse_opt_uuid(9, referred_by)?,
        created_at: parse_ts(10, &created_at)?,
        updated_at: parse_ts(11, &updated_at)?,
    })
}
