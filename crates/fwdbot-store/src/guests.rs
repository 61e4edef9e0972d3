use rusqlite::params;
use uuid::Uuid;

use crate::db::{col_ts, col_uuid, now_text, Store};
use crate::error::{Result, StoreError};
use crate::models::Guest;

const COLS: &str = "id, bot_id, guest_user_id, created_at";

impl Store {
    /// Guests are auto-created on first contact; the (bot, external user)
    /// pair is unique.
    pub fn get_or_create_guest(&self, bot_id: Uuid, guest_user_id: i64) -> Result<Guest> {
        match self.guest_by_bot_and_user(bot_id, guest_user_id) {
            Ok(guest) => Ok(guest),
            Err(StoreError::NotFound) => {
                let id = Uuid::new_v4();
                self.conn().execute(
                    "INSERT INTO guests (id, bot_id, guest_user_id, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id.to_string(),
                        bot_id.to_string(),
                        guest_user_id,
                        now_text()
                    ],
                )?;
                self.guest_by_id(id)
            }
            Err(e) => Err(e),
        }
    }

    pub fn guest_by_id(&self, id: Uuid) -> Result<Guest> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM guests WHERE id = ?1"),
                params![id.to_string()],
                row_to_guest,
            )
            .map_err(StoreError::from_query)
    }

    pub fn guest_by_bot_and_user(&self, bot_id: Uuid, guest_user_id: i64) -> Result<Guest> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM guests WHERE bot_id = ?1 AND guest_user_id = ?2"),
                params![bot_id.to_string(), guest_user_id],
                row_to_guest,
            )
            .map_err(StoreError::from_query)
    }

    pub fn guest_count_for_bot(&self, bot_id: Uuid) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM guests WHERE bot_id = ?1",
                params![bot_id.to_string()],
                |row| row.get(0),
            )
            .map_err(StoreError::from_query)
    }
}

fn row_to_guest(row: &rusqlite::Row<'_>) -> rusqlite::Result<Guest> {
    Ok(Guest {
        id: col_uuid(row, 0)?,
        bot_id: col_uuid(row, 1)?,
        guest_user_id: row.get(2)?,
        created_at: col_ts(row, 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_auto_create_and_count() {
        let store = Store::open_in_memory().unwrap();
        let mgr = store.get_or_create_user(1, None).unwrap().id;
        let bot = store.register_bot("c", "b", mgr, 1).unwrap().id;

        let g1 = store.get_or_create_guest(bot, 500).unwrap();
        let g2 = store.get_or_create_guest(bot, 500).unwrap();
        assert_eq!(g1.id, g2.id);

        store.get_or_create_guest(bot, 501).unwrap();
        assert_eq!(store.guest_count_for_bot(bot).unwrap(), 2);
    }
}
