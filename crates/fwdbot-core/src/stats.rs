//! Statistics aggregations over the mapping and guest counts.

use std::collections::HashSet;

use fwdbot_store::models::Direction;
use fwdbot_store::Store;
use uuid::Uuid;

use crate::Result;

pub struct StatsService {
    store: Store,
}

#[derive(Clone, Debug, Default)]
pub struct GlobalStats {
    pub manager_count: usize,
    pub bot_count: usize,
    pub total_inbound: i64,
    pub total_outbound: i64,
    pub total_guests: i64,
}

#[derive(Clone, Debug)]
pub struct BotStats {
    pub bot_id: Uuid,
    pub bot_name: String,
    pub inbound: i64,
    pub outbound: i64,
    pub guests: i64,
}

impl StatsService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn global(&self) -> Result<GlobalStats> {
        let bots = self.store.all_bots()?;

        let mut stats = GlobalStats {
            bot_count: bots.len(),
            ..Default::default()
        };
        let mut managers = HashSet::new();

        for bot in &bots {
            managers.insert(bot.manager_id);
            stats.total_inbound += self.store.mapping_count(bot.id, Direction::Inbound)?;
            stats.total_outbound += self.store.mapping_count(bot.id, Direction::Outbound)?;
            stats.total_guests += self.store.guest_count_for_bot(bot.id)?;
        }
        stats.manager_count = managers.len();

        Ok(stats)
    }

    pub fn for_manager(&self, manager_id: Uuid) -> Result<Vec<BotStats>> {
        let bots = self.store.bots_by_manager(manager_id)?;
        bots.iter().map(|bot| self.for_bot(bot.id)).collect()
    }

    pub fn for_bot(&self, bot_id: Uuid) -> Result<BotStats> {
        let bot = self.store.bot_by_id(bot_id)?;
        Ok(BotStats {
            bot_id,
            bot_name: bot.name,
            inbound: self.store.mapping_count(bot_id, Direction::Inbound)?,
            outbound: self.store.mapping_count(bot_id, Direction::Outbound)?,
            guests: self.store.guest_count_for_bot(bot_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwdbot_store::mappings::NewMapping;

    #[test]
    fn global_counts_span_bots() {
        let store = Store::open_in_memory().unwrap();
        let stats = StatsService::new(store.clone());

        let mgr_a = store.get_or_create_user(1, None).unwrap().id;
        let mgr_b = store.get_or_create_user(2, None).unwrap().id;
        let bot_a = store.register_bot("c1", "a", mgr_a, 1).unwrap().id;
        let bot_b = store.register_bot("c2", "b", mgr_b, 2).unwrap().id;
        // Same manager twice still counts once.
        store.register_bot("c3", "a2", mgr_a, 1).unwrap();

        store.get_or_create_guest(bot_a, 500).unwrap();
        store
            .insert_mapping(NewMapping {
                bot_id: bot_a,
                guest_chat_id: 500,
                guest_message_id: 1,
                recipient_chat_id: -1,
                recipient_message_id: 2,
                direction: Direction::Inbound,
            })
            .unwrap();
        store
            .insert_mapping(NewMapping {
                bot_id: bot_b,
                guest_chat_id: 501,
                guest_message_id: 1,
                recipient_chat_id: -2,
                recipient_message_id: 3,
                direction: Direction::Outbound,
            })
            .unwrap();

        let global = stats.global().unwrap();
        assert_eq!(global.bot_count, 3);
        assert_eq!(global.manager_count, 2);
        assert_eq!(global.total_inbound, 1);
        assert_eq!(global.total_outbound, 1);
        assert_eq!(global.total_guests, 1);

        let mine = stats.for_manager(mgr_a).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].inbound, 1);
    }
}
