use rusqlite::params;
use uuid::Uuid;

use crate::db::{col_ts, col_uuid, now_text, Store};
use crate::error::{Result, StoreError};
use crate::models::{BotAdmin, User};

impl Store {
    pub fn add_admin(&self, bot_id: Uuid, admin_user_id: Uuid) -> Result<BotAdmin> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO bot_admins (id, bot_id, admin_user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    bot_id.to_string(),
                    admin_user_id.to_string(),
                    now_text()
                ],
            )
            .map_err(|e| StoreError::conflict_or_sqlite(e, "user is already an admin"))?;

        self.conn()
            .query_row(
                "SELECT id, bot_id, admin_user_id, created_at FROM bot_admins WHERE id = ?1",
                params![id.to_string()],
                row_to_admin,
            )
            .map_err(StoreError::from_query)
    }

    pub fn is_admin(&self, bot_id: Uuid, user_id: Uuid) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM bot_admins
             WHERE bot_id = ?1 AND admin_user_id = ?2 AND deleted_at IS NULL",
            params![bot_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The admin users of a bot, joined through to their external identity
    /// (needed to post approval prompts).
    pub fn admin_users_for_bot(&self, bot_id: Uuid) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.telegram_user_id, u.username, u.created_at
             FROM bot_admins a
             JOIN users u ON u.id = a.admin_user_id
             WHERE a.bot_id = ?1 AND a.deleted_at IS NULL AND u.deleted_at IS NULL
             ORDER BY a.created_at",
        )?;
        let rows = stmt.query_map(params![bot_id.to_string()], |row| {
            Ok(User {
                id: col_uuid(row, 0)?,
                telegram_user_id: row.get(1)?,
                username: row.get(2)?,
                created_at: col_ts(row, 3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn remove_admin(&self, bot_id: Uuid, admin_user_id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE bot_admins SET deleted_at = ?1
             WHERE bot_id = ?2 AND admin_user_id = ?3 AND deleted_at IS NULL",
            params![now_text(), bot_id.to_string(), admin_user_id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_admin(row: &rusqlite::Row<'_>) -> rusqlite::Result<BotAdmin> {
    Ok(BotAdmin {
        id: col_uuid(row, 0)?,
        bot_id: col_uuid(row, 1)?,
        admin_user_id: col_uuid(row, 2)?,
        created_at: col_ts(row, 3)?,
    })
}
