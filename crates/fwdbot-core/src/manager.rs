//! Manager control surface.
//!
//! The single admin bot: registration and lifecycle of tenant bots,
//! fleet browsing, global statistics. Commands and typed callbacks are
//! routed here; lifecycle effects go through the supervisor.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fwdbot_store::models::{AuditAction, BotRecord};
use fwdbot_store::Store;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callback::CallbackAction;
use crate::domain::MessageRef;
use crate::format::escape_markdown;
use crate::port::{BotTransport, CommandSpec, InlineButton, InlineKeyboard, TransportFactory};
use crate::retry::RetryPolicy;
use crate::stats::StatsService;
use crate::supervisor::BotSupervisor;
use crate::update::{CallbackUpdate, IncomingUpdate, MessageUpdate};
use crate::vault::TokenVault;
use crate::{errors::Error, Result};

const MANAGER_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        description: "Show help message",
    },
    CommandSpec {
        command: "addbot",
        description: "Register a new ForwarderBot",
    },
    CommandSpec {
        command: "mybots",
        description: "List all your ForwarderBots",
    },
    CommandSpec {
        command: "manage",
        description: "Open management menu",
    },
    CommandSpec {
        command: "stats",
        description: "View global statistics",
    },
];

pub struct ManagerService {
    store: Store,
    stats: Arc<StatsService>,
    vault: Arc<TokenVault>,
    factory: Arc<dyn TransportFactory>,
    supervisor: Arc<BotSupervisor>,
    retry: RetryPolicy,
    superusers: Vec<i64>,
    commands_published: AtomicBool,
}

impl ManagerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        stats: Arc<StatsService>,
        vault: Arc<TokenVault>,
        factory: Arc<dyn TransportFactory>,
        supervisor: Arc<BotSupervisor>,
        retry: RetryPolicy,
        superusers: Vec<i64>,
    ) -> Self {
        Self {
            store,
            stats,
            vault,
            factory,
            supervisor,
            retry,
            superusers,
            commands_published: AtomicBool::new(false),
        }
    }

    pub fn is_superuser(&self, user_id: i64) -> bool {
        self.superusers.contains(&user_id)
    }

    fn is_bot_manager(&self, user_id: i64, bot: &BotRecord) -> bool {
        self.store
            .user_by_telegram_id(user_id)
            .map(|u| u.id == bot.manager_id)
            .unwrap_or(false)
    }

    pub async fn handle_update(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        update: IncomingUpdate,
    ) {
        let result = match update {
            IncomingUpdate::Message(msg) => self.handle_message(cancel, transport, msg).await,
            IncomingUpdate::Callback(cb) => self.handle_callback(transport, cb).await,
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "manager update handling failed");
        }
    }

    async fn handle_message(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        msg: MessageUpdate,
    ) -> Result<()> {
        let Some((cmd, args)) = msg.command() else {
            return Ok(()); // the manager bot only speaks commands
        };

        self.publish_commands_once(transport).await;

        match cmd.as_str() {
            "help" => self.cmd_help(transport, &msg).await,
            "addbot" => self.cmd_add_bot(cancel, transport, &msg, &args).await,
            "mybots" => self.cmd_my_bots(transport, &msg).await,
            "manage" => {
                self.require_superuser(transport, &msg).await?;
                self.cmd_manage(transport, &msg).await
            }
            "stats" => {
                self.require_superuser(transport, &msg).await?;
                self.cmd_stats(transport, &msg).await
            }
            _ => {
                transport
                    .send_text(
                        msg.chat_id,
                        "Unknown command. Use /help for available commands.",
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Publishes the command menu once per process lifetime.
    async fn publish_commands_once(&self, transport: &Arc<dyn BotTransport>) {
        if self.commands_published.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = transport.set_command_menu(MANAGER_COMMANDS).await {
            tracing::warn!(error = %e, "failed to publish command menu");
        }
    }

    async fn require_superuser(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<()> {
        if self.is_superuser(msg.user_id.0) {
            return Ok(());
        }
        transport
            .send_text(msg.chat_id, "You are not authorized to use this command.")
            .await?;
        Err(Error::Unauthorized("superuser role required".to_string()))
    }

    // ----- commands -----

    async fn cmd_help(&self, transport: &Arc<dyn BotTransport>, msg: &MessageUpdate) -> Result<()> {
        let mut help = String::from(
            "*ManagerBot Commands*\n\n\
             */help* - Show this help message\n\
             */addbot <token>* - Register a new ForwarderBot\n\
             */mybots* - List all your ForwarderBots\n",
        );

        if self.is_superuser(msg.user_id.0) {
            help.push_str(
                "\n*Superuser Commands:*\n\
                 */manage* - Open management menu\n\
                 */stats* - View global statistics\n",
            );
        }

        help.push_str(
            "\n*Usage:*\n\
             1. Use /addbot to register a ForwarderBot\n\
             2. Use /mybots to manage your bots\n\
             3. Each ForwarderBot can forward messages between Guests and Recipients",
        );

        transport.send_markdown(msg.chat_id, &help).await?;
        Ok(())
    }

    async fn cmd_add_bot(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
        args: &str,
    ) -> Result<()> {
        let Some(token) = args.split_whitespace().next() else {
            transport
                .send_text(
                    msg.chat_id,
                    "Usage: /addbot <token>\nExample: /addbot 123456789:ABCdefGHIjklMNOpqrsTUVwxyz",
                )
                .await?;
            return Ok(());
        };

        let wait = transport
            .send_text(msg.chat_id, "⏳ Processing, please wait...")
            .await
            .ok();

        // Step 1: validate the credential against the platform's identity
        // endpoint, through the retry executor (and the configured proxy,
        // which the factory bakes into every client it builds).
        let identity = match self.verify_credential(cancel, token).await {
            Ok(identity) => identity,
            Err(e) => {
                self.edit_progress(
                    transport,
                    wait,
                    &format!(
                        "❌ Failed to verify bot token: `{}`",
                        escape_markdown(&e.to_string())
                    ),
                )
                .await;
                return Err(e);
            }
        };

        let manager = self
            .store
            .get_or_create_user(msg.user_id.0, msg.username.as_deref())?;

        // Step 2: reject duplicates. Tokens are stored encrypted with a
        // fresh nonce each time, so equality means decrypt-and-compare.
        match self.find_duplicate(token) {
            Ok(Some(existing)) => {
                self.edit_progress(
                    transport,
                    wait,
                    &format!(
                        "❌ Bot @{} is already registered.",
                        escape_markdown(&existing.name)
                    ),
                )
                .await;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "duplicate check failed, continuing");
            }
        }

        // Step 3: persist atomically (bot + manager recipient + audit).
        let ciphertext = self.vault.encrypt(token)?;
        let record = match self.store.register_bot(
            &ciphertext,
            &identity.username,
            manager.id,
            manager.telegram_user_id,
        ) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "bot registration transaction failed");
                self.edit_progress(
                    transport,
                    wait,
                    "❌ Failed to register bot due to database error. Please try again later.",
                )
                .await;
                return Err(e.into());
            }
        };

        // Step 4: start immediately. A start failure leaves the rows in
        // place; the bot will come up on next boot.
        if let Err(e) = self.supervisor.start(record.id).await {
            tracing::error!(bot_id = %record.id, error = %e, "failed to start bot after registration");
            self.edit_progress(
                transport,
                wait,
                &format!(
                    "⚠️ Bot @{} has been registered, but failed to start immediately. It will be started on next application restart.",
                    escape_markdown(&record.name)
                ),
            )
            .await;
            return Err(e);
        }

        self.edit_progress(
            transport,
            wait,
            &format!(
                "✅ Bot @{} has been successfully registered and started!",
                escape_markdown(&record.name)
            ),
        )
        .await;
        Ok(())
    }

    async fn verify_credential(
        &self,
        cancel: &CancellationToken,
        token: &str,
    ) -> Result<crate::port::BotIdentity> {
        let connection = self.factory.connect(token).await?;
        let transport = connection.transport;
        self.retry
            .run(cancel, || {
                let transport = transport.clone();
                async move { transport.identity().await }
            })
            .await
    }

    fn find_duplicate(&self, token: &str) -> Result<Option<BotRecord>> {
        for record in self.store.all_bots()? {
            match self.vault.decrypt(&record.token) {
                Ok(stored) if stored == token => return Ok(Some(record)),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(bot_id = %record.id, error = %e, "stored token not decryptable with current key");
                }
            }
        }
        Ok(None)
    }

    async fn edit_progress(
        &self,
        transport: &Arc<dyn BotTransport>,
        wait: Option<MessageRef>,
        text: &str,
    ) {
        let Some(wait) = wait else { return };
        if let Err(e) = transport.edit_markdown(wait, text, None).await {
            tracing::warn!(error = %e, "failed to update progress message");
        }
    }

    async fn cmd_my_bots(&self, transport: &Arc<dyn BotTransport>, msg: &MessageUpdate) -> Result<()> {
        let user = self
            .store
            .get_or_create_user(msg.user_id.0, msg.username.as_deref())?;
        let bots = self.store.bots_by_manager(user.id)?;

        if bots.is_empty() {
            transport
                .send_text(
                    msg.chat_id,
                    "You don't have any bots registered. Use /addbot to register one.",
                )
                .await?;
            return Ok(());
        }

        let buttons = bots
            .iter()
            .map(|bot| {
                InlineButton::new(
                    format!("@{}", bot.name),
                    CallbackAction::BotView(bot.id).encode(),
                )
            })
            .collect();

        transport
            .send_with_keyboard(
                msg.chat_id,
                "Select a bot to manage:",
                InlineKeyboard::one_per_row(buttons),
            )
            .await?;
        Ok(())
    }

    async fn cmd_manage(&self, transport: &Arc<dyn BotTransport>, msg: &MessageUpdate) -> Result<()> {
        transport
            .send_with_keyboard(msg.chat_id, "Management Menu:", manage_menu_keyboard())
            .await?;
        Ok(())
    }

    async fn cmd_stats(&self, transport: &Arc<dyn BotTransport>, msg: &MessageUpdate) -> Result<()> {
        let stats = self.stats.global()?;
        let text = format!(
            "*Global Statistics*\n\n\
             Managers: {}\n\
             Bots: {}\n\
             Inbound Messages: {}\n\
             Outbound Messages: {}\n\
             Total Guests: {}",
            stats.manager_count,
            stats.bot_count,
            stats.total_inbound,
            stats.total_outbound,
            stats.total_guests,
        );
        transport.send_markdown(msg.chat_id, &text).await?;
        Ok(())
    }

    // ----- callbacks -----

    async fn handle_callback(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: CallbackUpdate,
    ) -> Result<()> {
        let action = match CallbackAction::from_str(&cb.data) {
            Ok(action) => action,
            Err(e) => {
                transport
                    .answer_callback(&cb.callback_id, Some("Invalid callback data"))
                    .await?;
                return Err(e);
            }
        };

        match action {
            CallbackAction::ManageMenu
            | CallbackAction::ManageAllBots
            | CallbackAction::ManageAllManagers => {
                if !self.is_superuser(cb.user_id.0) {
                    return self.deny_callback(transport, &cb).await;
                }
                match action {
                    CallbackAction::ManageMenu => self.cb_manage_menu(transport, &cb).await,
                    CallbackAction::ManageAllBots => self.cb_all_bots(transport, &cb).await,
                    _ => self.cb_all_managers(transport, &cb).await,
                }
            }
            CallbackAction::ManagerView(manager_id) => {
                if !self.is_superuser(cb.user_id.0) {
                    return self.deny_callback(transport, &cb).await;
                }
                self.cb_view_manager(transport, &cb, manager_id).await
            }
            CallbackAction::BotView(bot_id) => self.cb_view_bot(transport, &cb, bot_id).await,
            CallbackAction::BotDelete(bot_id) => {
                self.cb_confirm_delete(transport, &cb, bot_id).await
            }
            CallbackAction::DeleteBotConfirmed(bot_id) => {
                self.cb_execute_delete(transport, &cb, bot_id).await
            }
            CallbackAction::DeleteBotCancelled(_) => {
                transport
                    .answer_callback(&cb.callback_id, Some("Deletion cancelled"))
                    .await?;
                Ok(())
            }
            CallbackAction::MyBotsList => self.cb_my_bots_list(transport, &cb).await,
            CallbackAction::BlacklistDecision { .. } | CallbackAction::BlacklistStatus(_) => {
                // Moderation prompts are posted by the tenant bots.
                transport
                    .answer_callback(&cb.callback_id, Some("Unknown action"))
                    .await?;
                Ok(())
            }
        }
    }

    async fn deny_callback(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
    ) -> Result<()> {
        transport
            .answer_callback(&cb.callback_id, Some("You are not authorized to access this."))
            .await?;
        Ok(())
    }

    /// Re-render helper: edit the message the keyboard hangs on when it is
    /// still accessible, otherwise send a new one.
    async fn render(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        transport.answer_callback(&cb.callback_id, None).await?;

        if let Some(msg) = cb.message {
            if transport
                .edit_markdown(msg, text, Some(keyboard.clone()))
                .await
                .is_ok()
            {
                return Ok(());
            }
        }

        let chat_id = cb
            .chat_id
            .ok_or_else(|| Error::Validation("callback without chat".to_string()))?;
        transport
            .send_with_keyboard(chat_id, text, keyboard)
            .await?;
        Ok(())
    }

    async fn cb_manage_menu(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
    ) -> Result<()> {
        self.render(transport, cb, "Management Menu:", manage_menu_keyboard())
            .await
    }

    async fn cb_all_bots(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
    ) -> Result<()> {
        let bots = self.store.all_bots()?;
        if bots.is_empty() {
            transport
                .answer_callback(&cb.callback_id, Some("No bots registered"))
                .await?;
            return Ok(());
        }

        let mut buttons: Vec<InlineButton> = bots
            .iter()
            .map(|bot| {
                InlineButton::new(
                    format!("@{}", bot.name),
                    CallbackAction::BotView(bot.id).encode(),
                )
            })
            .collect();
        buttons.push(InlineButton::new("Back", CallbackAction::ManageMenu.encode()));

        self.render(
            transport,
            cb,
            "Select a bot to view details:",
            InlineKeyboard::one_per_row(buttons),
        )
        .await
    }

    async fn cb_all_managers(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
    ) -> Result<()> {
        let bots = self.store.all_bots()?;
        let mut managers: Vec<(Uuid, String)> = Vec::new();
        for bot in &bots {
            if managers.iter().any(|(id, _)| *id == bot.manager_id) {
                continue;
            }
            if let Ok(user) = self.store.user_by_id(bot.manager_id) {
                let name = user.username.unwrap_or_else(|| "Unknown".to_string());
                managers.push((user.id, name));
            }
        }

        if managers.is_empty() {
            transport
                .answer_callback(&cb.callback_id, Some("No managers found"))
                .await?;
            return Ok(());
        }

        let mut buttons: Vec<InlineButton> = managers
            .into_iter()
            .map(|(id, name)| {
                InlineButton::new(format!("@{name}"), CallbackAction::ManagerView(id).encode())
            })
            .collect();
        buttons.push(InlineButton::new("Back", CallbackAction::ManageMenu.encode()));

        self.render(
            transport,
            cb,
            "Select a manager to view their bots:",
            InlineKeyboard::one_per_row(buttons),
        )
        .await
    }

    async fn cb_view_manager(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
        manager_id: Uuid,
    ) -> Result<()> {
        let bots = self.store.bots_by_manager(manager_id)?;
        if bots.is_empty() {
            transport
                .answer_callback(&cb.callback_id, Some("This manager has no bots"))
                .await?;
            return Ok(());
        }

        let mut buttons: Vec<InlineButton> = bots
            .iter()
            .map(|bot| {
                InlineButton::new(
                    format!("@{}", bot.name),
                    CallbackAction::BotView(bot.id).encode(),
                )
            })
            .collect();
        buttons.push(InlineButton::new(
            "Back",
            CallbackAction::ManageAllManagers.encode(),
        ));

        self.render(
            transport,
            cb,
            "This manager's bots:",
            InlineKeyboard::one_per_row(buttons),
        )
        .await
    }

    async fn cb_view_bot(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
        bot_id: Uuid,
    ) -> Result<()> {
        let bot = match self.store.bot_by_id(bot_id) {
            Ok(bot) => bot,
            Err(fwdbot_store::StoreError::NotFound) => {
                transport
                    .answer_callback(&cb.callback_id, Some("Bot not found"))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !self.is_superuser(cb.user_id.0) && !self.is_bot_manager(cb.user_id.0, &bot) {
            return self.deny_callback(transport, cb).await;
        }

        let stats = self.stats.for_bot(bot_id)?;
        let running = self.supervisor.is_running(bot_id).await;
        let text = format!(
            "*Bot @{}*\n\n\
             Status: {}\n\
             Created: {}\n\
             Inbound Messages: {}\n\
             Outbound Messages: {}\n\
             Guests: {}",
            escape_markdown(&bot.name),
            if running { "running" } else { "stopped" },
            bot.created_at.format("%Y-%m-%d"),
            stats.inbound,
            stats.outbound,
            stats.guests,
        );

        let keyboard = InlineKeyboard::one_per_row(vec![
            InlineButton::new("Delete", CallbackAction::BotDelete(bot_id).encode()),
            InlineButton::new("Back", CallbackAction::MyBotsList.encode()),
        ]);

        self.render(transport, cb, &text, keyboard).await
    }

    async fn cb_confirm_delete(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
        bot_id: Uuid,
    ) -> Result<()> {
        let bot = match self.store.bot_by_id(bot_id) {
            Ok(bot) => bot,
            Err(fwdbot_store::StoreError::NotFound) => {
                transport
                    .answer_callback(&cb.callback_id, Some("Bot not found"))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !self.is_superuser(cb.user_id.0) && !self.is_bot_manager(cb.user_id.0, &bot) {
            return self.deny_callback(transport, cb).await;
        }

        let text = format!(
            "Are you sure you want to delete @{}?\nThe bot will be stopped and its configuration removed.",
            escape_markdown(&bot.name)
        );
        let keyboard = InlineKeyboard::row(vec![
            InlineButton::new(
                "Yes, delete",
                CallbackAction::DeleteBotConfirmed(bot_id).encode(),
            ),
            InlineButton::new("No", CallbackAction::DeleteBotCancelled(bot_id).encode()),
        ]);

        self.render(transport, cb, &text, keyboard).await
    }

    async fn cb_execute_delete(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
        bot_id: Uuid,
    ) -> Result<()> {
        let bot = match self.store.bot_by_id(bot_id) {
            Ok(bot) => bot,
            Err(fwdbot_store::StoreError::NotFound) => {
                transport
                    .answer_callback(&cb.callback_id, Some("Bot not found"))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !self.is_superuser(cb.user_id.0) && !self.is_bot_manager(cb.user_id.0, &bot) {
            return self.deny_callback(transport, cb).await;
        }

        transport.answer_callback(&cb.callback_id, None).await?;

        // Stop the loop before removing the row, so no update is ever
        // dispatched for a bot that no longer exists.
        self.supervisor.stop(bot_id).await;

        if !self.store.delete_bot(bot_id)? {
            transport
                .answer_callback(&cb.callback_id, Some("Failed to delete bot"))
                .await?;
            return Ok(());
        }

        let actor = self.store.user_by_telegram_id(cb.user_id.0).map(|u| u.id).ok();
        if let Err(e) = self.store.insert_audit(
            actor,
            AuditAction::DeleteBot,
            "bot",
            bot_id,
            serde_json::json!({ "bot_id": bot_id.to_string(), "bot_name": bot.name }),
        ) {
            tracing::warn!(error = %e, "failed to audit bot deletion");
        }

        let text = format!("Bot @{} has been deleted.", escape_markdown(&bot.name));
        if let Some(msg) = cb.message {
            let _ = transport.edit_markdown(msg, &text, None).await;
        } else if let Some(chat_id) = cb.chat_id {
            let _ = transport.send_markdown(chat_id, &text).await;
        }
        Ok(())
    }

    async fn cb_my_bots_list(
        &self,
        transport: &Arc<dyn BotTransport>,
        cb: &CallbackUpdate,
    ) -> Result<()> {
        let Ok(user) = self.store.user_by_telegram_id(cb.user_id.0) else {
            transport
                .answer_callback(&cb.callback_id, Some("No bots registered"))
                .await?;
            return Ok(());
        };

        let bots = self.store.bots_by_manager(user.id)?;
        if bots.is_empty() {
            transport
                .answer_callback(&cb.callback_id, Some("No bots registered"))
                .await?;
            return Ok(());
        }

        let buttons = bots
            .iter()
            .map(|bot| {
                InlineButton::new(
                    format!("@{}", bot.name),
                    CallbackAction::BotView(bot.id).encode(),
                )
            })
            .collect();

        self.render(
            transport,
            cb,
            "Select a bot to manage:",
            InlineKeyboard::one_per_row(buttons),
        )
        .await
    }
}

fn manage_menu_keyboard() -> InlineKeyboard {
    InlineKeyboard::one_per_row(vec![
        InlineButton::new("View All Bots", CallbackAction::ManageAllBots.encode()),
        InlineButton::new(
            "View All Managers",
            CallbackAction::ManageAllManagers.encode(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalFlow;
    use crate::blacklist::BlacklistEngine;
    use crate::domain::{ChatId, MessageId, UserId};
    use crate::health::RecipientMonitor;
    use crate::notify::{ErrorNotifier, ManagerNotifier};
    use crate::pipeline::Forwarder;
    use crate::ratelimit::RateLimiter;
    use crate::supervisor::SupervisorDeps;
    use crate::testing::{MockFactory, MockTransport};
    use std::time::Duration;

    const SUPERUSER: i64 = 1;
    const MANAGER_TG: i64 = 1000;

    struct Fixture {
        service: ManagerService,
        store: Store,
        factory: Arc<MockFactory>,
        supervisor: Arc<BotSupervisor>,
        manager_bot: Arc<MockTransport>,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let vault = Arc::new(TokenVault::new(&[7u8; 32]));
        let factory = Arc::new(MockFactory::new());
        let manager_bot = Arc::new(MockTransport::new());
        let manager_transport: Arc<dyn BotTransport> = manager_bot.clone();

        let error_notifier = Arc::new(ErrorNotifier::new(manager_transport.clone(), vec![SUPERUSER]));
        let monitor = Arc::new(RecipientMonitor::new(store.clone()));
        let forwarder = Arc::new(Forwarder::new(
            store.clone(),
            Arc::new(RateLimiter::new(100, 100, None)),
            RetryPolicy::new(2, Duration::from_millis(1)),
            monitor.clone(),
            error_notifier.clone(),
            Arc::new(ManagerNotifier::new(manager_transport.clone(), store.clone())),
        ));

        let supervisor = BotSupervisor::new(
            SupervisorDeps {
                store: store.clone(),
                vault: vault.clone(),
                factory: factory.clone(),
                forwarder,
                blacklist: Arc::new(BlacklistEngine::new(store.clone())),
                approvals: Arc::new(ApprovalFlow::new(store.clone())),
                stats: Arc::new(StatsService::new(store.clone())),
                error_notifier,
                monitor,
                sweep_interval: Duration::from_secs(3600),
            },
            CancellationToken::new(),
        );

        let service = ManagerService::new(
            store.clone(),
            Arc::new(StatsService::new(store.clone())),
            vault,
            factory.clone(),
            supervisor.clone(),
            RetryPolicy::new(2, Duration::from_millis(1)),
            vec![SUPERUSER],
        );

        Fixture {
            service,
            store,
            factory,
            supervisor,
            manager_bot,
            cancel: CancellationToken::new(),
        }
    }

    fn command(user: i64, text: &str) -> IncomingUpdate {
        IncomingUpdate::Message(MessageUpdate {
            chat_id: ChatId(user),
            user_id: UserId(user),
            username: Some("mgr".to_string()),
            message_id: MessageId(1),
            text: Some(text.to_string()),
            reply_to: None,
        })
    }

    async fn dispatch(f: &Fixture, update: IncomingUpdate) {
        let transport: Arc<dyn BotTransport> = f.manager_bot.clone();
        f.service.handle_update(&f.cancel, &transport, update).await;
    }

    #[tokio::test]
    async fn addbot_registers_and_starts_immediately() {
        let f = fixture();
        // The tenant transport must report an identity for validation.
        let token = "12345:valid-token";
        f.factory.set_identity(token, 12345, "testbot");

        dispatch(&f, command(MANAGER_TG, &format!("/addbot {token}"))).await;

        // Row exists and the poll loop is live.
        let bots = f.store.all_bots().unwrap();
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].name, "testbot");
        assert!(f.supervisor.is_running(bots[0].id).await);

        // The progress message ended on success.
        let edits = f.manager_bot.edits();
        assert!(edits.last().unwrap().1.contains("successfully registered and started"));

        // The manager was seeded as recipient.
        assert!(f.store.recipient_by_chat(bots[0].id, MANAGER_TG).is_ok());

        f.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn addbot_rejects_duplicates() {
        let f = fixture();
        let token = "12345:valid-token";
        f.factory.set_identity(token, 12345, "testbot");

        dispatch(&f, command(MANAGER_TG, &format!("/addbot {token}"))).await;
        dispatch(&f, command(MANAGER_TG, &format!("/addbot {token}"))).await;

        assert_eq!(f.store.all_bots().unwrap().len(), 1);
        let edits = f.manager_bot.edits();
        assert!(edits.last().unwrap().1.contains("already registered"));

        f.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn addbot_with_bad_credential_fails_cleanly() {
        let f = fixture();
        f.factory.fail_token("bad-token");

        dispatch(&f, command(MANAGER_TG, "/addbot bad-token")).await;

        assert!(f.store.all_bots().unwrap().is_empty());
        let edits = f.manager_bot.edits();
        assert!(edits.last().unwrap().1.contains("Failed to verify bot token"));
    }

    #[tokio::test]
    async fn manage_and_stats_are_superuser_only() {
        let f = fixture();

        dispatch(&f, command(MANAGER_TG, "/manage")).await;
        let replies = f.manager_bot.sent_to(ChatId(MANAGER_TG));
        assert!(replies.last().unwrap().text.contains("not authorized"));

        dispatch(&f, command(SUPERUSER, "/manage")).await;
        let replies = f.manager_bot.sent_to(ChatId(SUPERUSER));
        assert!(replies.last().unwrap().text.contains("Management Menu"));
        assert!(replies.last().unwrap().keyboard.is_some());

        dispatch(&f, command(SUPERUSER, "/stats")).await;
        let replies = f.manager_bot.sent_to(ChatId(SUPERUSER));
        assert!(replies.last().unwrap().text.contains("Global Statistics"));
    }

    #[tokio::test]
    async fn delete_flow_stops_the_bot_before_removing_the_row() {
        let f = fixture();
        let token = "12345:valid-token";
        f.factory.set_identity(token, 12345, "testbot");
        dispatch(&f, command(MANAGER_TG, &format!("/addbot {token}"))).await;
        let bot = f.store.all_bots().unwrap()[0].clone();
        assert!(f.supervisor.is_running(bot.id).await);

        // Two-step confirm, then execute.
        let confirm = IncomingUpdate::Callback(CallbackUpdate {
            callback_id: "cb1".to_string(),
            user_id: UserId(MANAGER_TG),
            username: None,
            chat_id: Some(ChatId(MANAGER_TG)),
            message: None,
            data: CallbackAction::BotDelete(bot.id).encode(),
        });
        dispatch(&f, confirm).await;
        // Still alive and present after the first step.
        assert!(f.supervisor.is_running(bot.id).await);
        assert!(f.store.bot_by_id(bot.id).is_ok());

        let execute = IncomingUpdate::Callback(CallbackUpdate {
            callback_id: "cb2".to_string(),
            user_id: UserId(MANAGER_TG),
            username: None,
            chat_id: Some(ChatId(MANAGER_TG)),
            message: None,
            data: CallbackAction::DeleteBotConfirmed(bot.id).encode(),
        });
        dispatch(&f, execute).await;

        assert!(!f.supervisor.is_running(bot.id).await);
        assert!(matches!(
            f.store.bot_by_id(bot.id),
            Err(fwdbot_store::StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let f = fixture();
        let token = "12345:valid-token";
        f.factory.set_identity(token, 12345, "testbot");
        dispatch(&f, command(MANAGER_TG, &format!("/addbot {token}"))).await;
        let bot = f.store.all_bots().unwrap()[0].clone();

        // A different (non-superuser) user cannot delete it.
        f.store.get_or_create_user(555, None).unwrap();
        let execute = IncomingUpdate::Callback(CallbackUpdate {
            callback_id: "cb3".to_string(),
            user_id: UserId(555),
            username: None,
            chat_id: Some(ChatId(555)),
            message: None,
            data: CallbackAction::DeleteBotConfirmed(bot.id).encode(),
        });
        dispatch(&f, execute).await;

        assert!(f.store.bot_by_id(bot.id).is_ok());
        let answers = f.manager_bot.answers();
        assert!(answers
            .iter()
            .any(|(_, text)| text.as_deref() == Some("You are not authorized to access this.")));

        f.supervisor.stop_all().await;
    }
}
