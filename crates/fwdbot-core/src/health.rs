//! Recipient health monitor.
//!
//! A recipient whose chat is structurally gone (group deleted, bot
//! blocked or kicked, chat not found) is pruned and the removal audited.
//! Transient probe failures leave the recipient intact. Group recipients
//! are additionally swept on a periodic ticker; user recipients are only
//! checked when a forward to them fails.

use std::sync::Arc;
use std::time::Duration;

use fwdbot_store::models::{AuditAction, Recipient, RecipientKind};
use fwdbot_store::Store;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::ChatId;
use crate::port::BotTransport;

pub struct RecipientMonitor {
    store: Store,
}

impl RecipientMonitor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Probes the recipient's chat. Returns false when the recipient was
    /// found gone and removed.
    pub async fn check(
        &self,
        transport: &Arc<dyn BotTransport>,
        bot_id: Uuid,
        recipient: &Recipient,
    ) -> bool {
        match transport.get_chat(ChatId(recipient.chat_id)).await {
            Ok(()) => true,
            Err(e) if e.is_chat_gone() => {
                tracing::info!(
                    bot_id = %bot_id,
                    chat_id = recipient.chat_id,
                    error = %e,
                    "recipient chat is gone, removing"
                );

                match self.store.remove_recipient(recipient.id) {
                    Ok(true) => {
                        let details = serde_json::json!({
                            "chat_id": recipient.chat_id,
                            "reason": "chat_not_found_or_bot_blocked",
                        });
                        if let Err(audit_err) = self.store.insert_audit(
                            None,
                            AuditAction::DelRecipient,
                            "recipient",
                            recipient.id,
                            details,
                        ) {
                            tracing::warn!(error = %audit_err, "failed to audit recipient removal");
                        }
                        false
                    }
                    Ok(false) => false, // already removed by a sibling task
                    Err(del_err) => {
                        tracing::error!(
                            bot_id = %bot_id,
                            chat_id = recipient.chat_id,
                            error = %del_err,
                            "failed to delete invalid recipient"
                        );
                        false
                    }
                }
            }
            Err(e) => {
                tracing::debug!(
                    bot_id = %bot_id,
                    chat_id = recipient.chat_id,
                    error = %e,
                    "transient error probing recipient, keeping it"
                );
                true
            }
        }
    }

    /// One pass over the bot's group recipients.
    pub async fn sweep(&self, transport: &Arc<dyn BotTransport>, bot_id: Uuid) {
        let recipients = match self.store.recipients_for_bot(bot_id) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(bot_id = %bot_id, error = %e, "failed to load recipients for sweep");
                return;
            }
        };

        for recipient in recipients {
            if recipient.kind != RecipientKind::Group {
                continue;
            }
            self.check(transport, bot_id, &recipient).await;
        }
    }

    /// Periodic sweep task; runs once on start and then on every tick
    /// until cancelled. The supervisor spawns one per running bot.
    pub async fn run_periodic(
        self: Arc<Self>,
        transport: Arc<dyn BotTransport>,
        bot_id: Uuid,
        cancel: CancellationToken,
        interval: Duration,
    ) {
        self.sweep(&transport, bot_id).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep(&transport, bot_id).await,
            }
        }
    }
}
