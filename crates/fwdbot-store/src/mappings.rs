//! Message mappings are the reply reverse-index. Rows are immutable and
//! only ever written after a successful external forward.

use rusqlite::params;
use uuid::Uuid;

use crate::db::{col_ts, col_uuid, now_text, Store};
use crate::error::{Result, StoreError};
use crate::models::{Direction, MessageMapping};

const COLS: &str = "id, bot_id, guest_chat_id, guest_message_id, recipient_chat_id, recipient_message_id, direction, created_at";

pub struct NewMapping {
    pub bot_id: Uuid,
    pub guest_chat_id: i64,
    pub guest_message_id: i64,
    pub recipient_chat_id: i64,
    pub recipient_message_id: i64,
    pub direction: Direction,
}

impl Store {
    pub fn insert_mapping(&self, mapping: NewMapping) -> Result<MessageMapping> {
        let id = Uuid::new_v4();
        self.conn().execute(
            &format!("INSERT INTO message_mappings ({COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                id.to_string(),
                mapping.bot_id.to_string(),
                mapping.guest_chat_id,
                mapping.guest_message_id,
                mapping.recipient_chat_id,
                mapping.recipient_message_id,
                mapping.direction.as_str(),
                now_text()
            ],
        )?;
        self.mapping_by_id(id)
    }

    pub fn mapping_by_id(&self, id: Uuid) -> Result<MessageMapping> {
        self.conn()
            .query_row(
                &format!("SELECT {COLS} FROM message_mappings WHERE id = ?1"),
                params![id.to_string()],
                row_to_mapping,
            )
            .map_err(StoreError::from_query)
    }

    /// Guest-side lookup; rarely on the hot path but provided for tooling.
    pub fn mapping_by_guest_message(
        &self,
        bot_id: Uuid,
        guest_chat_id: i64,
        guest_message_id: i64,
    ) -> Result<MessageMapping> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {COLS} FROM message_mappings
                     WHERE bot_id = ?1 AND guest_chat_id = ?2 AND guest_message_id = ?3
                     ORDER BY created_at LIMIT 1"
                ),
                params![bot_id.to_string(), guest_chat_id, guest_message_id],
                row_to_mapping,
            )
            .map_err(StoreError::from_query)
    }

    /// Recipient-side lookup used by the reply resolver.
    pub fn mapping_by_recipient_message(
        &self,
        bot_id: Uuid,
        recipient_chat_id: i64,
        recipient_message_id: i64,
    ) -> Result<MessageMapping> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {COLS} FROM message_mappings
                     WHERE bot_id = ?1 AND recipient_chat_id = ?2 AND recipient_message_id = ?3
                     ORDER BY created_at LIMIT 1"
                ),
                params![bot_id.to_string(), recipient_chat_id, recipient_message_id],
                row_to_mapping,
            )
            .map_err(StoreError::from_query)
    }

    pub fn mapping_count(&self, bot_id: Uuid, direction: Direction) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM message_mappings WHERE bot_id = ?1 AND direction = ?2",
                params![bot_id.to_string(), direction.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from_query)
    }
}

fn row_to_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageMapping> {
    let direction_raw: String = row.get(6)?;
    let direction = Direction::try_from(direction_raw.as_str()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(MessageMapping {
        id: col_uuid(row, 0)?,
        bot_id: col_uuid(row, 1)?,
        guest_chat_id: row.get(2)?,
        guest_message_id: row.get(3)?,
        recipient_chat_id: row.get(4)?,
        recipient_message_id: row.get(5)?,
        direction,
        created_at: col_ts(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_bot(store: &Store) -> Uuid {
        let mgr = store.get_or_create_user(1, None).unwrap().id;
        store.register_bot("c", "b", mgr, 1).unwrap().id
    }

    #[test]
    fn insert_then_lookup_both_sides() {
        let store = Store::open_in_memory().unwrap();
        let bot = seeded_bot(&store);

        let inserted = store
            .insert_mapping(NewMapping {
                bot_id: bot,
                guest_chat_id: 500,
                guest_message_id: 10,
                recipient_chat_id: -100,
                recipient_message_id: 42,
                direction: Direction::Inbound,
            })
            .unwrap();

        let by_recipient = store.mapping_by_recipient_message(bot, -100, 42).unwrap();
        assert_eq!(by_recipient.id, inserted.id);
        assert_eq!(by_recipient.guest_chat_id, 500);

        let by_guest = store.mapping_by_guest_message(bot, 500, 10).unwrap();
        assert_eq!(by_guest.id, inserted.id);

        assert!(matches!(
            store.mapping_by_recipient_message(bot, -100, 43),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn counts_split_by_direction() {
        let store = Store::open_in_memory().unwrap();
        let bot = seeded_bot(&store);

        for direction in [Direction::Inbound, Direction::Inbound, Direction::Outbound] {
            store
                .insert_mapping(NewMapping {
                    bot_id: bot,
                    guest_chat_id: 500,
                    guest_message_id: 10,
                    recipient_chat_id: -100,
                    recipient_message_id: 42,
                    direction,
                })
                .unwrap();
        }

        assert_eq!(store.mapping_count(bot, Direction::Inbound).unwrap(), 2);
        assert_eq!(store.mapping_count(bot, Direction::Outbound).unwrap(), 1);
    }
}
