use rusqlite::params;
use uuid::Uuid;

use crate::db::{col_ts, col_uuid, now_text, Store};
use crate::error::{Result, StoreError};
use crate::models::{Recipient, RecipientKind};

const COLS: &str = "id, bot_id, kind, chat_id, created_at";

impl Store {
    pub fn add_recipient(
        &self,
        bot_id: Uuid,
        kind: RecipientKind,
        chat_id: i64,
    ) -> Result<Recipient> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO recipients (id, bot_id, kind, chat_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    bot_id.to_string(),
                    kind.as_str(),
                    chat_id,
                    now_text()
                ],
            )
            .map_err(|e| StoreError::conflict_or_sqlite(e, "recipient already exists"))?;

        self.recipient_by_id(id)
    }

    pub fn recipient_by_id(&self, id: Uuid) -> Result<Recipient> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM recipients WHERE id = ?1 AND deleted_at IS NULL"),
                params![id.to_string()],
                row_to_recipient,
            )
            .map_err(StoreError::from_query)
    }

    pub fn recipients_for_bot(&self, bot_id: Uuid) -> Result<Vec<Recipient>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM recipients
             WHERE bot_id = ?1 AND deleted_at IS NULL ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![bot_id.to_string()], row_to_recipient)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn recipient_by_chat(&self, bot_id: Uuid, chat_id: i64) -> Result<Recipient> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {COLS} FROM recipients
                     WHERE bot_id = ?1 AND chat_id = ?2 AND deleted_at IS NULL"
                ),
                params![bot_id.to_string(), chat_id],
                row_to_recipient,
            )
            .map_err(StoreError::from_query)
    }

    pub fn remove_recipient(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE recipients SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now_text(), id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_recipient(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recipient> {
    let kind_raw: String = row.get(2)?;
    let kind = RecipientKind::try_from(kind_raw.as_str()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Recipient {
        id: col_uuid(row, 0)?,
        bot_id: col_uuid(row, 1)?,
        kind,
        chat_id: row.get(3)?,
        created_at: col_ts(row, 4)?,
    })
}
