//! Fan-out pipeline and reply resolver.
//!
//! Inbound: one concurrent forwarding task per recipient, each gated on
//! the global API limiter and driven through the retry executor; a
//! mapping row is written only after the forward succeeded. Outbound: a
//! recipient's reply is resolved against the mapping index and forwarded
//! back to the originating guest.

use std::sync::Arc;
use std::time::Duration;

use fwdbot_store::mappings::NewMapping;
use fwdbot_store::models::Direction;
use fwdbot_store::Store;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{BotId, ChatId, MessageId};
use crate::format::{escape_markdown, now_display};
use crate::health::RecipientMonitor;
use crate::notify::{escalate_if_credential_invalid, ErrorNotifier, ManagerNotifier};
use crate::port::BotTransport;
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::update::MessageUpdate;
use crate::{errors::Error, Result};

const GUEST_RATE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct ForwardOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<Error>,
}

pub struct Forwarder {
    store: Store,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    monitor: Arc<RecipientMonitor>,
    error_notifier: Arc<ErrorNotifier>,
    manager_notifier: Arc<ManagerNotifier>,
}

impl Forwarder {
    pub fn new(
        store: Store,
        rate_limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        monitor: Arc<RecipientMonitor>,
        error_notifier: Arc<ErrorNotifier>,
        manager_notifier: Arc<ManagerNotifier>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            retry,
            monitor,
            error_notifier,
            manager_notifier,
        }
    }

    /// Fans a guest message out to every live recipient of the bot.
    ///
    /// One recipient's failure never aborts its siblings; the caller gets
    /// an aggregate outcome and the bot's manager a single batched
    /// summary when anything failed.
    pub async fn forward_from_guest(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        bot_id: Uuid,
        guest_chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<ForwardOutcome> {
        let recipients = self.store.recipients_for_bot(bot_id)?;
        if recipients.is_empty() {
            tracing::debug!(bot_id = %bot_id, "no recipients, skipping forward");
            return Ok(ForwardOutcome::default());
        }

        self.store.get_or_create_guest(bot_id, guest_chat_id.0)?;

        // Guest rate gate: on exceed, delay once for the refill window and
        // re-check; proceed regardless to avoid an indefinite stall.
        if !self
            .rate_limiter
            .allow_guest_message(BotId(bot_id), guest_chat_id.0)
            .await
        {
            tracing::warn!(
                bot_id = %bot_id,
                guest_chat_id = guest_chat_id.0,
                "guest message rate exceeded, delaying send"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(GUEST_RATE_DELAY) => {}
            }
            if !self
                .rate_limiter
                .allow_guest_message(BotId(bot_id), guest_chat_id.0)
                .await
            {
                tracing::warn!(
                    bot_id = %bot_id,
                    guest_chat_id = guest_chat_id.0,
                    "guest still rate limited after delay, forwarding anyway"
                );
            }
        }

        let mut tasks = JoinSet::new();
        for recipient in recipients {
            let this = Arc::clone(self);
            let transport = Arc::clone(transport);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                this.forward_to_recipient(&cancel, &transport, bot_id, guest_chat_id, message_id, recipient)
                    .await
            });
        }

        let mut outcome = ForwardOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => outcome.success_count += 1,
                Ok(Err(e)) => {
                    outcome.failure_count += 1;
                    outcome.errors.push(e);
                }
                Err(join_err) => {
                    outcome.failure_count += 1;
                    outcome
                        .errors
                        .push(Error::Internal(format!("forward task failed: {join_err}")));
                }
            }
        }

        if outcome.failure_count > 0 {
            self.notify_manager_of_failures(bot_id, &outcome).await;
        }

        tracing::debug!(
            bot_id = %bot_id,
            success = outcome.success_count,
            failures = outcome.failure_count,
            "fan-out completed"
        );
        Ok(outcome)
    }

    async fn forward_to_recipient(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        bot_id: Uuid,
        guest_chat_id: ChatId,
        message_id: MessageId,
        recipient: fwdbot_store::models::Recipient,
    ) -> Result<()> {
        if !self.rate_limiter.allow_telegram_api().await {
            tracing::warn!(
                bot_id = %bot_id,
                recipient_chat_id = recipient.chat_id,
                "global API rate exceeded, dropping forward to recipient"
            );
            return Err(Error::RateLimited);
        }

        let recipient_chat = ChatId(recipient.chat_id);
        let result = self
            .retry
            .run(cancel, || {
                let transport = Arc::clone(transport);
                let store = self.store.clone();
                async move {
                    let forwarded = transport
                        .forward_message(recipient_chat, guest_chat_id, message_id)
                        .await?;

                    // The mapping row exists only because the forward
                    // succeeded; a write failure is operator-visible but
                    // does not undo the delivery.
                    if let Err(e) = store.insert_mapping(NewMapping {
                        bot_id,
                        guest_chat_id: guest_chat_id.0,
                        guest_message_id: message_id.0 as i64,
                        recipient_chat_id: recipient_chat.0,
                        recipient_message_id: forwarded.message_id.0 as i64,
                        direction: Direction::Inbound,
                    }) {
                        tracing::warn!(
                            bot_id = %bot_id,
                            guest_message_id = message_id.0,
                            error = %e,
                            "failed to create message mapping"
                        );
                    }
                    Ok(())
                }
            })
            .await;

        let Err(err) = result else {
            return Ok(());
        };

        tracing::warn!(
            bot_id = %bot_id,
            recipient_chat_id = recipient.chat_id,
            error = %err,
            "failed to forward message after retries"
        );

        self.send_failure_notice(transport, recipient_chat, &err).await;

        escalate_if_credential_invalid(
            &self.error_notifier,
            &err,
            format!("Bot ID: {bot_id}, Chat ID: {}", recipient.chat_id),
        )
        .await;

        if !self.monitor.check(transport, bot_id, &recipient).await {
            tracing::info!(
                bot_id = %bot_id,
                recipient_chat_id = recipient.chat_id,
                "invalid recipient detected and removed"
            );
        }

        Err(err)
    }

    async fn send_failure_notice(
        &self,
        transport: &Arc<dyn BotTransport>,
        recipient_chat: ChatId,
        err: &Error,
    ) {
        let message = format!(
            "*Message Forwarding Failed*\n\n\
             Error: `{}`\n\
             Retry Attempts: {}\n\
             Time: {}",
            escape_markdown(&err.to_string()),
            self.retry.max_attempts,
            now_display(),
        );

        if let Err(send_err) = transport.send_markdown(recipient_chat, &message).await {
            tracing::warn!(
                recipient_chat_id = recipient_chat.0,
                error = %send_err,
                "failed to send failure notification"
            );
        }
    }

    async fn notify_manager_of_failures(&self, bot_id: Uuid, outcome: &ForwardOutcome) {
        let error_lines = outcome
            .errors
            .iter()
            .map(|e| escape_markdown(&e.to_string()))
            .collect::<Vec<_>>()
            .join("\n");

        let message = format!(
            "*Batch Forwarding Failed*\n\n\
             Bot ID: `{bot_id}`\n\
             Success: {}\n\
             Failures: {}\n\
             Retry Attempts: {}\n\
             Errors:\n{error_lines}\n\
             Time: {}",
            outcome.success_count,
            outcome.failure_count,
            self.retry.max_attempts,
            now_display(),
        );

        if let Err(e) = self.manager_notifier.notify_manager(bot_id, &message).await {
            tracing::warn!(bot_id = %bot_id, error = %e, "failed to notify manager about forwarding failures");
        }
    }

    /// Forwards a recipient's reply back to the originating guest.
    ///
    /// Only messages that exist in the mapping index are ever re-routed;
    /// a reply to an unmapped message surfaces as `NotFound`, which the
    /// caller drops with a log entry.
    pub async fn forward_reply_to_guest(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        bot_id: Uuid,
        recipient_chat_id: ChatId,
        reply: &MessageUpdate,
    ) -> Result<()> {
        let Some(reply_to) = reply.reply_to else {
            return Err(Error::Validation("message is not a reply".to_string()));
        };

        let mapping = self.store.mapping_by_recipient_message(
            bot_id,
            recipient_chat_id.0,
            reply_to.message_id.0 as i64,
        )?;

        if !self.rate_limiter.allow_telegram_api().await {
            return Err(Error::RateLimited);
        }

        let guest_chat = ChatId(mapping.guest_chat_id);
        let guest_message_id = mapping.guest_message_id;
        let reply_message_id = reply.message_id;
        self.retry
            .run(cancel, || {
                let transport = Arc::clone(transport);
                let store = self.store.clone();
                async move {
                    transport
                        .forward_message(guest_chat, recipient_chat_id, reply_message_id)
                        .await?;

                    if let Err(e) = store.insert_mapping(NewMapping {
                        bot_id,
                        guest_chat_id: guest_chat.0,
                        guest_message_id,
                        recipient_chat_id: recipient_chat_id.0,
                        recipient_message_id: reply_message_id.0 as i64,
                        direction: Direction::Outbound,
                    }) {
                        tracing::warn!(bot_id = %bot_id, error = %e, "failed to create reply mapping");
                    }
                    Ok(())
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageRef;
    use crate::errors::ApiErrorKind;
    use crate::testing::MockTransport;
    use fwdbot_store::models::RecipientKind;

    const MANAGER_TG: i64 = 1000;
    const GUEST_CHAT: ChatId = ChatId(500);

    struct Fixture {
        forwarder: Arc<Forwarder>,
        store: Store,
        bot: Uuid,
        tenant: Arc<MockTransport>,
        manager_bot: Arc<MockTransport>,
        cancel: CancellationToken,
    }

    fn fixture(api_rate: u32) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let mgr = store.get_or_create_user(MANAGER_TG, Some("mgr")).unwrap().id;
        let bot = store.register_bot("c", "testbot", mgr, MANAGER_TG).unwrap().id;

        let tenant = Arc::new(MockTransport::new());
        let manager_bot = Arc::new(MockTransport::new());
        let manager_transport: Arc<dyn BotTransport> = manager_bot.clone();

        let forwarder = Arc::new(Forwarder::new(
            store.clone(),
            Arc::new(RateLimiter::new(api_rate, 100, None)),
            RetryPolicy::new(3, Duration::from_millis(1)),
            Arc::new(RecipientMonitor::new(store.clone())),
            Arc::new(ErrorNotifier::new(manager_transport.clone(), vec![1])),
            Arc::new(ManagerNotifier::new(manager_transport, store.clone())),
        ));

        Fixture {
            forwarder,
            store,
            bot,
            tenant,
            manager_bot,
            cancel: CancellationToken::new(),
        }
    }

    fn add_groups(f: &Fixture, chats: &[i64]) {
        for &chat in chats {
            f.store.add_recipient(f.bot, RecipientKind::Group, chat).unwrap();
        }
    }

    async fn run_fanout(f: &Fixture, message_id: i32) -> ForwardOutcome {
        let transport: Arc<dyn BotTransport> = f.tenant.clone();
        f.forwarder
            .forward_from_guest(&f.cancel, &transport, f.bot, GUEST_CHAT, MessageId(message_id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_writes_one_mapping_per_recipient() {
        let f = fixture(100);
        // The manager seed recipient plus two groups.
        add_groups(&f, &[-101, -102]);

        let outcome = run_fanout(&f, 10).await;

        assert_eq!(outcome.success_count, 3);
        assert_eq!(outcome.failure_count, 0);
        assert_eq!(
            f.store.mapping_count(f.bot, Direction::Inbound).unwrap(),
            3
        );
        // No failure summary reached the manager.
        assert!(f.manager_bot.sent_to(ChatId(MANAGER_TG)).is_empty());
        // The guest row was auto-created.
        assert!(f.store.guest_by_bot_and_user(f.bot, GUEST_CHAT.0).is_ok());
    }

    #[tokio::test]
    async fn partial_failure_retries_prunes_and_summarizes() {
        let f = fixture(100);
        add_groups(&f, &[-101, -102, -103]);

        // -102 fails twice with 500s, then succeeds.
        f.tenant.script_forward_failure(ChatId(-102), ApiErrorKind::Server, "500 Internal Server Error");
        f.tenant.script_forward_failure(ChatId(-102), ApiErrorKind::Server, "500 Internal Server Error");
        // -103 is blocked for good.
        f.tenant.script_forward_failure(
            ChatId(-103),
            ApiErrorKind::ChatGone,
            "Forbidden: bot was blocked by the user",
        );
        f.tenant.mark_chat_gone(ChatId(-103));

        let outcome = run_fanout(&f, 10).await;

        // Manager seed + -101 + retried -102 succeed; -103 fails.
        assert_eq!(outcome.success_count, 3);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(
            f.store.mapping_count(f.bot, Direction::Inbound).unwrap(),
            3
        );

        // -103 was pruned by the health monitor.
        assert!(matches!(
            f.store.recipient_by_chat(f.bot, -103),
            Err(fwdbot_store::StoreError::NotFound)
        ));

        // One batched summary to the manager, mentioning the failure.
        let summaries = f.manager_bot.sent_to(ChatId(MANAGER_TG));
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].text.contains("Batch Forwarding Failed"));
        assert!(summaries[0].text.contains("Failures: 1"));

        // The failing recipient got a failure notice in its chat.
        let notices = f.tenant.sent_to(ChatId(-103));
        assert_eq!(notices.len(), 1);
        assert!(notices[0].text.contains("Message Forwarding Failed"));
    }

    #[tokio::test]
    async fn api_rate_limit_drops_without_retry() {
        // Budget of 1: only a single recipient task gets through.
        let f = fixture(1);
        add_groups(&f, &[-101]);

        let outcome = run_fanout(&f, 10).await;

        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.failure_count, 1);
        assert!(outcome
            .errors
            .iter()
            .any(|e| matches!(e, Error::RateLimited)));
        assert_eq!(
            f.store.mapping_count(f.bot, Direction::Inbound).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn no_recipients_is_a_zeroed_outcome() {
        let f = fixture(100);
        // Remove the seeded manager recipient.
        let seed = f.store.recipient_by_chat(f.bot, MANAGER_TG).unwrap();
        f.store.remove_recipient(seed.id).unwrap();

        let outcome = run_fanout(&f, 10).await;
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.failure_count, 0);
        assert!(f.tenant.forwards().is_empty());
    }

    #[tokio::test]
    async fn reply_routes_to_original_guest_only() {
        let f = fixture(100);
        add_groups(&f, &[-101]);

        // Inbound: guest message 10 lands in -101.
        run_fanout(&f, 10).await;
        let inbound = f
            .store
            .mapping_by_guest_message(f.bot, GUEST_CHAT.0, 10)
            .unwrap();
        let forwarded_id = inbound
            .recipient_message_id;

        // A recipient replies to the forwarded copy.
        let reply = MessageUpdate {
            chat_id: ChatId(inbound.recipient_chat_id),
            user_id: crate::domain::UserId(77),
            username: None,
            message_id: MessageId(9000),
            text: Some("reply".to_string()),
            reply_to: Some(MessageRef {
                chat_id: ChatId(inbound.recipient_chat_id),
                message_id: MessageId(forwarded_id as i32),
            }),
        };

        let transport: Arc<dyn BotTransport> = f.tenant.clone();
        f.forwarder
            .forward_reply_to_guest(
                &f.cancel,
                &transport,
                f.bot,
                ChatId(inbound.recipient_chat_id),
                &reply,
            )
            .await
            .unwrap();

        // The reply went to the guest chat and nowhere else.
        let last_forward = f.tenant.forwards().pop().unwrap();
        assert_eq!(last_forward.to, GUEST_CHAT);

        let outbound = f
            .store
            .mapping_by_recipient_message(f.bot, inbound.recipient_chat_id, 9000)
            .unwrap();
        assert_eq!(outbound.direction, Direction::Outbound);
        assert_eq!(outbound.guest_chat_id, GUEST_CHAT.0);
        assert_eq!(f.store.mapping_count(f.bot, Direction::Outbound).unwrap(), 1);
    }

    #[tokio::test]
    async fn reply_to_unmapped_message_is_not_forwarded() {
        let f = fixture(100);
        add_groups(&f, &[-101]);

        let reply = MessageUpdate {
            chat_id: ChatId(-101),
            user_id: crate::domain::UserId(77),
            username: None,
            message_id: MessageId(9000),
            text: Some("reply".to_string()),
            reply_to: Some(MessageRef {
                chat_id: ChatId(-101),
                message_id: MessageId(12345),
            }),
        };

        let transport: Arc<dyn BotTransport> = f.tenant.clone();
        let err = f
            .forwarder
            .forward_reply_to_guest(&f.cancel, &transport, f.bot, ChatId(-101), &reply)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(f.tenant.forwards().is_empty());
        assert_eq!(f.store.mapping_count(f.bot, Direction::Outbound).unwrap(), 0);
    }
}
