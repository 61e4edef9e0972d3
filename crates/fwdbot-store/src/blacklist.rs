//! Blacklist rows are append-only: the only mutation ever performed is the
//! pending → approved/rejected status transition.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::db::{col_ts, col_uuid, now_text, ts_text, Store};
use crate::error::{Result, StoreError};
use crate::models::{AuditEntry, BlacklistEntry, RequestKind, RequestStatus};

const COLS: &str =
    "id, bot_id, guest_id, request_kind, status, request_user_id, approved_at, created_at";

impl Store {
    pub fn insert_blacklist(
        &self,
        bot_id: Uuid,
        guest_id: Uuid,
        request_kind: RequestKind,
        request_user_id: Uuid,
    ) -> Result<BlacklistEntry> {
        let id = Uuid::new_v4();
        self.conn().execute(
            "INSERT INTO blacklist (id, bot_id, guest_id, request_kind, status, request_user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            params![
                id.to_string(),
                bot_id.to_string(),
                guest_id.to_string(),
                request_kind.as_str(),
                request_user_id.to_string(),
                now_text()
            ],
        )?;
        self.blacklist_by_id(id)
    }

    pub fn blacklist_by_id(&self, id: Uuid) -> Result<BlacklistEntry> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM blacklist WHERE id = ?1 AND deleted_at IS NULL"),
                params![id.to_string()],
                row_to_entry,
            )
            .map_err(StoreError::from_query)
    }

    /// The single row `isBlacklisted` derives from: latest by creation for
    /// the (bot, guest) pair, ignoring soft-deleted rows.
    pub fn latest_blacklist_for_guest(
        &self,
        bot_id: Uuid,
        guest_id: Uuid,
    ) -> Result<Option<BlacklistEntry>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {COLS} FROM blacklist
                     WHERE bot_id = ?1 AND guest_id = ?2 AND deleted_at IS NULL
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![bot_id.to_string(), guest_id.to_string()],
                row_to_entry,
            )
            .map_err(StoreError::from_query);

        match found {
            Ok(entry) => Ok(Some(entry)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn pending_blacklist_for_bot(&self, bot_id: Uuid) -> Result<Vec<BlacklistEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM blacklist
             WHERE bot_id = ?1 AND status = 'pending' AND deleted_at IS NULL
             ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![bot_id.to_string()], row_to_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }

    /// Transitions `pending → decision` and writes the audit entry in the
    /// same transaction. Returns false when the row was not pending (lost
    /// race or repeated button press); nothing is written in that case.
    pub fn decide_blacklist(
        &self,
        id: Uuid,
        decision: RequestStatus,
        audit: &AuditEntry,
    ) -> Result<bool> {
        debug_assert!(decision != RequestStatus::Pending);

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let now = now_text();
        let affected = match decision {
            RequestStatus::Approved => tx.execute(
                "UPDATE blacklist SET status = 'approved', approved_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id.to_string()],
            )?,
            RequestStatus::Rejected => tx.execute(
                "UPDATE blacklist SET status = 'rejected'
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )?,
            RequestStatus::Pending => 0,
        };

        if affected == 0 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO audit_log (id, user_id, action, resource_type, resource_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                audit.id.to_string(),
                audit.user_id.map(|u| u.to_string()),
                audit.action.as_str(),
                audit.resource_type,
                audit.resource_id.to_string(),
                audit.details.to_string(),
                now
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Approves every entry still pending after the cutoff, stamping
    /// `approved_at`. Returns the number of rows flipped.
    pub fn auto_approve_expired(&self, created_before: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE blacklist SET status = 'approved', approved_at = ?1
             WHERE status = 'pending' AND created_at < ?2 AND deleted_at IS NULL",
            params![now_text(), ts_text(created_before)],
        )?;
        Ok(affected)
    }

    pub fn insert_approval_message(
        &self,
        blacklist_id: Uuid,
        user_id: Uuid,
        chat_id: i64,
        message_id: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO approval_messages (id, blacklist_id, user_id, chat_id, message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                blacklist_id.to_string(),
                user_id.to_string(),
                chat_id,
                message_id,
                now_text()
            ],
        )?;
        Ok(())
    }

    pub fn approval_messages_for(&self, blacklist_id: Uuid) -> Result<Vec<crate::models::ApprovalMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, blacklist_id, user_id, chat_id, message_id, created_at
             FROM approval_messages
             WHERE blacklist_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![blacklist_id.to_string()], |row| {
            Ok(crate::models::ApprovalMessage {
                id: col_uuid(row, 0)?,
                blacklist_id: col_uuid(row, 1)?,
                user_id: col_uuid(row, 2)?,
                chat_id: row.get(3)?,
                message_id: row.get(4)?,
                created_at: col_ts(row, 5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlacklistEntry> {
    let kind_raw: String = row.get(3)?;
    let kind = RequestKind::try_from(kind_raw.as_str()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_raw: String = row.get(4)?;
    let status = RequestStatus::try_from(status_raw.as_str()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let approved_raw: Option<String> = row.get(6)?;
    let approved_at = match approved_raw {
        Some(raw) => Some(crate::db::parse_ts(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(BlacklistEntry {
        id: col_uuid(row, 0)?,
        bot_id: col_uuid(row, 1)?,
        guest_id: col_uuid(row, 2)?,
        request_kind: kind,
        status,
        request_user_id: col_uuid(row, 5)?,
        approved_at,
        created_at: col_ts(row, 7)?,
    })
}
