use rusqlite::params;
use uuid::Uuid;

use crate::db::{col_ts, col_uuid, now_text, Store};
use crate::error::{Result, StoreError};
use crate::models::{AuditAction, BotRecord, RecipientKind};

const COLS: &str = "id, token, name, manager_id, created_at";

impl Store {
    /// Registers a bot atomically: the bot row, the manager as its first
    /// recipient, and the audit entry all commit together or not at all.
    pub fn register_bot(
        &self,
        token_ciphertext: &str,
        name: &str,
        manager_id: Uuid,
        manager_chat_id: i64,
    ) -> Result<BotRecord> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let bot_id = Uuid::new_v4();
        let created_at = now_text();
        tx.execute(
            "INSERT INTO bots (id, token, name, manager_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bot_id.to_string(),
                token_ciphertext,
                name,
                manager_id.to_string(),
                created_at
            ],
        )?;

        tx.execute(
            "INSERT INTO recipients (id, bot_id, kind, chat_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                bot_id.to_string(),
                RecipientKind::User.as_str(),
                manager_chat_id,
                created_at
            ],
        )?;

        let details = serde_json::json!({ "bot_id": bot_id.to_string(), "bot_name": name });
        tx.execute(
            "INSERT INTO audit_log (id, user_id, action, resource_type, resource_id, details, created_at)
             VALUES (?1, ?2, ?3, 'bot', ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                manager_id.to_string(),
                AuditAction::AddBot.as_str(),
                bot_id.to_string(),
                details.to_string(),
                created_at
            ],
        )?;

        tx.commit()?;
        drop(conn);

        self.bot_by_id(bot_id)
    }

    pub fn bot_by_id(&self, id: Uuid) -> Result<BotRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM bots WHERE id = ?1 AND deleted_at IS NULL"),
                params![id.to_string()],
                row_to_bot,
            )
            .map_err(StoreError::from_query)
    }

    pub fn all_bots(&self) -> Result<Vec<BotRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM bots WHERE deleted_at IS NULL ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], row_to_bot)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn bots_by_manager(&self, manager_id: Uuid) -> Result<Vec<BotRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM bots
             WHERE manager_id = ?1 AND deleted_at IS NULL ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![manager_id.to_string()], row_to_bot)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    /// Soft-deletes the bot row. Owned rows (recipients, guests, mappings,
    /// blacklist, admins) become unreachable because every read path joins
    /// through the live bot.
    pub fn delete_bot(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE bots SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now_text(), id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_bot(row: &rusqlite::Row<'_>) -> rusqlite::Result<BotRecord> {
    Ok(BotRecord {
        id: col_uuid(row, 0)?,
        token: row.get(1)?,
        name: row.get(2)?,
        manager_id: col_uuid(row, 3)?,
        created_at: col_ts(row, 4)?,
    })
}
