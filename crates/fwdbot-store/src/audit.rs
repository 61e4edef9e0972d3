use rusqlite::params;
use uuid::Uuid;

use crate::db::{now_text, Store};
use crate::error::Result;
use crate::models::AuditAction;

impl Store {
    /// Appends an audit row. Audit entries are never updated or deleted and
    /// outlive the resources they describe.
    pub fn insert_audit(
        &self,
        user_id: Option<Uuid>,
        action: AuditAction,
        resource_type: &str,
        resource_id: Uuid,
        details: serde_json::Value,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_log (id, user_id, action, resource_type, resource_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                user_id.map(|u| u.to_string()),
                action.as_str(),
                resource_type,
                resource_id.to_string(),
                details.to_string(),
                now_text()
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn audit_count(&self, action: AuditAction) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM audit_log WHERE action = ?1",
                params![action.as_str()],
                |row| row.get(0),
            )
            .map_err(crate::error::StoreError::from_query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_rows_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let mgr = store.get_or_create_user(1, None).unwrap().id;
        // register_bot writes an add_bot audit row.
        let bot = store.register_bot("c", "b", mgr, 1).unwrap();
        assert_eq!(store.audit_count(AuditAction::AddBot).unwrap(), 1);

        store
            .insert_audit(
                Some(mgr),
                AuditAction::DeleteBot,
                "bot",
                bot.id,
                serde_json::json!({ "bot_name": "b" }),
            )
            .unwrap();
        assert_eq!(store.audit_count(AuditAction::DeleteBot).unwrap(), 1);
    }
}
