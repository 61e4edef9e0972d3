use rusqlite::params;
use uuid::Uuid;

use crate::db::{col_ts, col_uuid, now_text, Store};
use crate::error::{Result, StoreError};
use crate::models::User;

const COLS: &str = "id, telegram_user_id, username, created_at";

impl Store {
    /// Looks a user up by external id, creating the row on first contact.
    /// A fresher username than the stored one is written through.
    pub fn get_or_create_user(
        &self,
        telegram_user_id: i64,
        username: Option<&str>,
    ) -> Result<User> {
        let conn = self.conn();

        let existing = conn
            .query_row(
                &format!("SELECT {COLS} FROM users WHERE telegram_user_id = ?1 AND deleted_at IS NULL"),
                params![telegram_user_id],
                row_to_user,
            )
            .map_err(StoreError::from_query);

        match existing {
            Ok(mut user) => {
                if let Some(name) = username {
                    if user.username.as_deref() != Some(name) {
                        conn.execute(
                            "UPDATE users SET username = ?1 WHERE id = ?2",
                            params![name, user.id.to_string()],
                        )?;
                        user.username = Some(name.to_string());
                    }
                }
                Ok(user)
            }
            Err(StoreError::NotFound) => {
                let id = Uuid::new_v4();
                let created_at = now_text();
                conn.execute(
                    "INSERT INTO users (id, telegram_user_id, username, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id.to_string(), telegram_user_id, username, created_at],
                )?;
                drop(conn);
                self.user_by_id(id)
            }
            Err(e) => Err(e),
        }
    }

    pub fn user_by_id(&self, id: Uuid) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM users WHERE id = ?1 AND deleted_at IS NULL"),
                params![id.to_string()],
                row_to_user,
            )
            .map_err(StoreError::from_query)
    }

    pub fn user_by_telegram_id(&self, telegram_user_id: i64) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM users WHERE telegram_user_id = ?1 AND deleted_at IS NULL"),
                params![telegram_user_id],
                row_to_user,
            )
            .map_err(StoreError::from_query)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: col_uuid(row, 0)?,
        telegram_user_id: row.get(1)?,
        username: row.get(2)?,
        created_at: col_ts(row, 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let store = Store::open_in_memory().unwrap();

        let a = store.get_or_create_user(42, Some("alice")).unwrap();
        let b = store.get_or_create_user(42, Some("alice")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.username.as_deref(), Some("alice"));
    }

    #[test]
    fn username_is_refreshed() {
        let store = Store::open_in_memory().unwrap();

        store.get_or_create_user(42, Some("old")).unwrap();
        let updated = store.get_or_create_user(42, Some("new")).unwrap();
        assert_eq!(updated.username.as_deref(), Some("new"));

        // None leaves the stored name alone.
        let kept = store.get_or_create_user(42, None).unwrap();
        assert_eq!(kept.username.as_deref(), Some("new"));
    }

    #[test]
    fn missing_user_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.user_by_telegram_id(1),
            Err(StoreError::NotFound)
        ));
    }
}
