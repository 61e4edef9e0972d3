//! Moderation approval flow.
//!
//! A pending blacklist entry produces one interactive prompt per reviewer
//! (the bot's manager and every admin). The prompt message ids are stored
//! so that, once anyone decides, every copy is edited into a static
//! "decided by X" form and the buttons are neutralized.

use std::sync::Arc;

use fwdbot_store::models::{AuditAction, AuditEntry, BlacklistEntry, RequestKind, RequestStatus, User};
use fwdbot_store::Store;
use uuid::Uuid;

use crate::callback::CallbackAction;
use crate::domain::ChatId;
use crate::port::{BotTransport, InlineButton, InlineKeyboard};
use crate::Result;

pub struct ApprovalFlow {
    store: Store,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionOutcome {
    Applied,
    /// The entry was no longer pending (second button press or lost race).
    AlreadyDecided,
}

impl ApprovalFlow {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Posts the Approve/Reject prompt to the bot's manager and every
    /// admin, recording each posted copy. Per-reviewer send failures are
    /// logged and skipped; the request itself stays pending either way.
    pub async fn send_request(
        &self,
        transport: &Arc<dyn BotTransport>,
        bot_id: Uuid,
        entry: &BlacklistEntry,
        prompt: &str,
    ) -> Result<()> {
        let bot = self.store.bot_by_id(bot_id)?;
        let manager = self.store.user_by_id(bot.manager_id)?;
        let admins = self.store.admin_users_for_bot(bot_id).unwrap_or_else(|e| {
            tracing::warn!(bot_id = %bot_id, error = %e, "failed to load admins for approval prompt");
            Vec::new()
        });

        let mut reviewers = vec![manager];
        reviewers.extend(admins);

        for reviewer in reviewers {
            let keyboard = InlineKeyboard::row(vec![
                InlineButton::new(
                    "Approve",
                    CallbackAction::BlacklistDecision {
                        entry_id: entry.id,
                        approve: true,
                    }
                    .encode(),
                ),
                InlineButton::new(
                    "Reject",
                    CallbackAction::BlacklistDecision {
                        entry_id: entry.id,
                        approve: false,
                    }
                    .encode(),
                ),
            ]);

            let sent = match transport
                .send_with_keyboard(ChatId(reviewer.telegram_user_id), prompt, keyboard)
                .await
            {
                Ok(sent) => sent,
                Err(e) => {
                    tracing::warn!(
                        reviewer = reviewer.telegram_user_id,
                        error = %e,
                        "failed to send approval request to reviewer"
                    );
                    continue;
                }
            };

            if let Err(e) = self.store.insert_approval_message(
                entry.id,
                reviewer.id,
                sent.chat_id.0,
                sent.message_id.0 as i64,
            ) {
                tracing::warn!(
                    reviewer = reviewer.telegram_user_id,
                    error = %e,
                    "failed to store approval message"
                );
            }
        }

        Ok(())
    }

    /// Applies a reviewer's decision: status transition + audit entry in
    /// one transaction, guest notification, and an edit of every stored
    /// prompt copy. The caller has already verified the actor's role.
    pub async fn handle_decision(
        &self,
        transport: &Arc<dyn BotTransport>,
        entry_id: Uuid,
        approve: bool,
        actor: &User,
    ) -> Result<DecisionOutcome> {
        let entry = self.store.blacklist_by_id(entry_id)?;

        let decision = if approve {
            RequestStatus::Approved
        } else {
            RequestStatus::Rejected
        };

        let action = match entry.request_kind {
            RequestKind::Ban => AuditAction::Ban,
            RequestKind::Unban => AuditAction::Unban,
        };
        let audit = AuditEntry {
            id: Uuid::new_v4(),
            user_id: Some(actor.id),
            action,
            resource_type: "blacklist".to_string(),
            resource_id: entry.id,
            details: serde_json::json!({
                "blacklist_id": entry.id.to_string(),
                "request_kind": entry.request_kind.as_str(),
                "decision": decision.as_str(),
            }),
            created_at: chrono::Utc::now(),
        };

        if !self.store.decide_blacklist(entry.id, decision, &audit)? {
            return Ok(DecisionOutcome::AlreadyDecided);
        }

        if approve {
            self.notify_guest(transport, &entry).await;
        }

        self.edit_prompts(transport, &entry, actor, approve).await;

        Ok(DecisionOutcome::Applied)
    }

    async fn notify_guest(&self, transport: &Arc<dyn BotTransport>, entry: &BlacklistEntry) {
        let guest = match self.store.guest_by_id(entry.guest_id) {
            Ok(guest) => guest,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load guest for decision notice");
                return;
            }
        };

        let text = match entry.request_kind {
            RequestKind::Ban => "You have been banned from this bot.",
            RequestKind::Unban => "You have been unbanned from this bot.",
        };

        if let Err(e) = transport.send_text(ChatId(guest.guest_user_id), text).await {
            tracing::warn!(
                guest = guest.guest_user_id,
                error = %e,
                "failed to notify guest about decision"
            );
        }
    }

    async fn edit_prompts(
        &self,
        transport: &Arc<dyn BotTransport>,
        entry: &BlacklistEntry,
        actor: &User,
        approved: bool,
    ) {
        let prompts = self.store.approval_messages_for(entry.id).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load approval messages");
            Vec::new()
        });

        let actor_name = actor
            .username
            .as_ref()
            .map(|u| format!("@{u}"))
            .unwrap_or_else(|| actor.telegram_user_id.to_string());

        let kind_text = match entry.request_kind {
            RequestKind::Ban => "Ban Request",
            RequestKind::Unban => "Unban Request",
        };
        let guest_user_id = self
            .store
            .guest_by_id(entry.guest_id)
            .map(|g| g.guest_user_id)
            .unwrap_or_default();
        let requester_id = self
            .store
            .user_by_id(entry.request_user_id)
            .map(|u| u.telegram_user_id)
            .unwrap_or_default();

        let base = format!(
            "*{kind_text}*\n\nGuest User ID: `{guest_user_id}`\nRequested by: `{requester_id}`\n"
        );
        let verb = if approved { "Approved" } else { "Rejected" };

        for prompt in prompts {
            // The executor's own copy shows the bare status; everyone
            // else sees who decided.
            let (button_text, message_text) = if prompt.user_id == actor.id {
                (verb.to_string(), format!("{base}\n*Status: {verb}*"))
            } else {
                (
                    format!("{verb} by {actor_name}"),
                    format!("{base}\n*Status: {verb} by {actor_name}*"),
                )
            };

            let keyboard = InlineKeyboard::row(vec![InlineButton::new(
                button_text,
                CallbackAction::BlacklistStatus(entry.id).encode(),
            )]);

            let msg_ref = crate::domain::MessageRef {
                chat_id: ChatId(prompt.chat_id),
                message_id: crate::domain::MessageId(prompt.message_id as i32),
            };
            if let Err(e) = transport
                .edit_markdown(msg_ref, &message_text, Some(keyboard))
                .await
            {
                tracing::warn!(
                    chat_id = prompt.chat_id,
                    message_id = prompt.message_id,
                    error = %e,
                    "failed to edit approval message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    struct Fixture {
        flow: ApprovalFlow,
        store: Store,
        transport: Arc<MockTransport>,
        bot: Uuid,
        manager: User,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let manager = store.get_or_create_user(1000, Some("mgr")).unwrap();
        let bot = store.register_bot("c", "b", manager.id, 1000).unwrap().id;
        Fixture {
            flow: ApprovalFlow::new(store.clone()),
            store,
            transport: Arc::new(MockTransport::new()),
            bot,
            manager,
        }
    }

    fn pending_entry(f: &Fixture) -> BlacklistEntry {
        let guest = f.store.get_or_create_guest(f.bot, 500).unwrap();
        f.store
            .insert_blacklist(f.bot, guest.id, RequestKind::Ban, f.manager.id)
            .unwrap()
    }

    #[tokio::test]
    async fn prompts_reach_manager_and_every_admin() {
        let f = fixture();
        let admin = f.store.get_or_create_user(2000, Some("adm")).unwrap();
        f.store.add_admin(f.bot, admin.id).unwrap();
        let entry = pending_entry(&f);

        let transport: Arc<dyn BotTransport> = f.transport.clone();
        f.flow
            .send_request(&transport, f.bot, &entry, "*Ban Request*")
            .await
            .unwrap();

        assert_eq!(f.transport.sent_to(ChatId(1000)).len(), 1);
        assert_eq!(f.transport.sent_to(ChatId(2000)).len(), 1);
        assert_eq!(f.store.approval_messages_for(entry.id).unwrap().len(), 2);

        // Both buttons carry the typed payload.
        let sent = f.transport.sent_to(ChatId(1000));
        let keyboard = sent[0].keyboard.as_ref().unwrap();
        assert_eq!(keyboard.rows[0].len(), 2);
        assert!(keyboard.rows[0][0].callback_data.starts_with("blacklist:approve:"));
    }

    #[tokio::test]
    async fn decision_edits_every_copy_and_notifies_guest() {
        let f = fixture();
        let admin = f.store.get_or_create_user(2000, Some("adm")).unwrap();
        f.store.add_admin(f.bot, admin.id).unwrap();
        let entry = pending_entry(&f);

        let transport: Arc<dyn BotTransport> = f.transport.clone();
        f.flow
            .send_request(&transport, f.bot, &entry, "*Ban Request*")
            .await
            .unwrap();

        let outcome = f
            .flow
            .handle_decision(&transport, entry.id, true, &admin)
            .await
            .unwrap();
        assert_eq!(outcome, DecisionOutcome::Applied);

        // Both prompt copies were edited; the non-executor copy names the
        // decider.
        let edits = f.transport.edits();
        assert_eq!(edits.len(), 2);
        assert!(edits.iter().any(|(_, text)| text.contains("*Status: Approved*")));
        assert!(edits.iter().any(|(_, text)| text.contains("Approved by @adm")));

        // The guest was told.
        let guest_msgs = f.transport.sent_to(ChatId(500));
        assert_eq!(guest_msgs.len(), 1);
        assert!(guest_msgs[0].text.contains("banned"));

        // Status transition is monotone: the second press is a no-op.
        let again = f
            .flow
            .handle_decision(&transport, entry.id, false, &admin)
            .await
            .unwrap();
        assert_eq!(again, DecisionOutcome::AlreadyDecided);
        assert_eq!(
            f.store.blacklist_by_id(entry.id).unwrap().status,
            RequestStatus::Approved
        );
    }

    #[tokio::test]
    async fn rejection_skips_guest_notice() {
        let f = fixture();
        let entry = pending_entry(&f);

        let transport: Arc<dyn BotTransport> = f.transport.clone();
        f.flow
            .send_request(&transport, f.bot, &entry, "*Ban Request*")
            .await
            .unwrap();
        f.flow
            .handle_decision(&transport, entry.id, false, &f.manager)
            .await
            .unwrap();

        assert!(f.transport.sent_to(ChatId(500)).is_empty());
        assert_eq!(
            f.store.blacklist_by_id(entry.id).unwrap().status,
            RequestStatus::Rejected
        );
    }
}
