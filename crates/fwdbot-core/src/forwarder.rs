//! Per-tenant (ForwarderBot) update handling.
//!
//! Routes each long-poll update: commands to their handlers, replies in
//! recipient chats to the reply resolver, everything else through the
//! blacklist gate into the fan-out pipeline.

use std::str::FromStr;
use std::sync::Arc;

use fwdbot_store::models::{AuditAction, RecipientKind};
use fwdbot_store::Store;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::{ApprovalFlow, DecisionOutcome};
use crate::blacklist::BlacklistEngine;
use crate::callback::CallbackAction;
use crate::domain::ChatId;
use crate::format::escape_markdown;
use crate::pipeline::Forwarder;
use crate::port::BotTransport;
use crate::stats::StatsService;
use crate::update::{CallbackUpdate, IncomingUpdate, MessageUpdate};
use crate::{errors::Error, Result};

pub struct ForwarderService {
    bot_id: Uuid,
    store: Store,
    forwarder: Arc<Forwarder>,
    blacklist: Arc<BlacklistEngine>,
    approvals: Arc<ApprovalFlow>,
    stats: Arc<StatsService>,
}

impl ForwarderService {
    pub fn new(
        bot_id: Uuid,
        store: Store,
        forwarder: Arc<Forwarder>,
        blacklist: Arc<BlacklistEngine>,
        approvals: Arc<ApprovalFlow>,
        stats: Arc<StatsService>,
    ) -> Self {
        Self {
            bot_id,
            store,
            forwarder,
            blacklist,
            approvals,
            stats,
        }
    }

    pub fn bot_id(&self) -> Uuid {
        self.bot_id
    }

    /// Entry point for the bot's long-poll loop. Errors are handled and
    /// logged here; the loop itself never dies on a bad update.
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
            tracing::warn!(bot_id = %self.bot_id, error = %e, "update handling failed");
        }
    }

    async fn handle_message(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        msg: MessageUpdate,
    ) -> Result<()> {
        if let Some((cmd, args)) = msg.command() {
            return self.handle_command(cancel, transport, &msg, &cmd, &args).await;
        }

        if msg.reply_to.is_some() {
            return self.handle_reply(cancel, transport, msg).await;
        }

        // A plain guest message: gate on the blacklist, then fan out.
        match self.blacklist.is_blacklisted(self.bot_id, msg.user_id.0) {
            Ok(true) => {
                tracing::debug!(
                    bot_id = %self.bot_id,
                    user_id = msg.user_id.0,
                    "guest is blacklisted, dropping message"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(bot_id = %self.bot_id, error = %e, "failed to check blacklist");
            }
        }

        self.forwarder
            .forward_from_guest(cancel, transport, self.bot_id, msg.chat_id, msg.message_id)
            .await?;
        Ok(())
    }

    async fn handle_reply(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        msg: MessageUpdate,
    ) -> Result<()> {
        // Replies only matter inside recipient chats.
        if self
            .store
            .recipient_by_chat(self.bot_id, msg.chat_id.0)
            .is_err()
        {
            tracing::debug!(
                bot_id = %self.bot_id,
                chat_id = msg.chat_id.0,
                "reply is not from a recipient chat, ignoring"
            );
            return Ok(());
        }

        match self
            .forwarder
            .forward_reply_to_guest(cancel, transport, self.bot_id, msg.chat_id, &msg)
            .await
        {
            Ok(()) => Ok(()),
            // A reply to a message the mapping store doesn't know is
            // dropped silently apart from this log line.
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    bot_id = %self.bot_id,
                    chat_id = msg.chat_id.0,
                    "no upstream mapping for reply, dropping"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_command(
        &self,
        cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
        cmd: &str,
        args: &str,
    ) -> Result<()> {
        match cmd {
            "help" => self.cmd_help(transport, msg).await,
            "stats" => {
                self.require_manager_or_admin(transport, msg).await?;
                self.cmd_stats(transport, msg).await
            }
            "addrecipient" => {
                self.require_manager_or_admin(transport, msg).await?;
                self.cmd_add_recipient(transport, msg, args).await
            }
            "delrecipient" => {
                self.require_manager_or_admin(transport, msg).await?;
                self.cmd_del_recipient(transport, msg, args).await
            }
            "listrecipient" => {
                self.require_manager_or_admin(transport, msg).await?;
                self.cmd_list_recipients(transport, msg).await
            }
            "addadmin" => {
                self.require_manager(transport, msg).await?;
                self.cmd_add_admin(transport, msg, args).await
            }
            "deladmin" => {
                self.require_manager(transport, msg).await?;
                self.cmd_del_admin(transport, msg, args).await
            }
            "listadmins" => {
                self.require_manager_or_admin(transport, msg).await?;
                self.cmd_list_admins(transport, msg).await
            }
            "ban" => self.cmd_ban(cancel, transport, msg).await,
            "unban" => self.cmd_unban(cancel, transport, msg).await,
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

    // ----- authorization -----

    fn is_manager(&self, user_id: i64) -> bool {
        let Ok(bot) = self.store.bot_by_id(self.bot_id) else {
            return false;
        };
        let Ok(user) = self.store.user_by_telegram_id(user_id) else {
            return false;
        };
        user.id == bot.manager_id
    }

    fn is_manager_or_admin(&self, user_id: i64) -> bool {
        if self.is_manager(user_id) {
            return true;
        }
        let Ok(user) = self.store.user_by_telegram_id(user_id) else {
            return false;
        };
        self.store.is_admin(self.bot_id, user.id).unwrap_or(false)
    }

    async fn require_manager(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<()> {
        if self.is_manager(msg.user_id.0) {
            return Ok(());
        }
        transport
            .send_text(msg.chat_id, "Only the manager can use this command.")
            .await?;
        Err(Error::Unauthorized("manager role required".to_string()))
    }

    async fn require_manager_or_admin(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<()> {
        if self.is_manager_or_admin(msg.user_id.0) {
            return Ok(());
        }
        transport
            .send_text(msg.chat_id, "You are not authorized to use this command.")
            .await?;
        Err(Error::Unauthorized("manager or admin role required".to_string()))
    }

    // ----- commands -----

    async fn cmd_help(&self, transport: &Arc<dyn BotTransport>, msg: &MessageUpdate) -> Result<()> {
        let is_manager = self.is_manager(msg.user_id.0);
        let is_privileged = self.is_manager_or_admin(msg.user_id.0);
        let in_recipient_chat = self
            .store
            .recipient_by_chat(self.bot_id, msg.chat_id.0)
            .is_ok();
        let pure_guest = !is_privileged && !in_recipient_chat;

        let mut help = String::from("*ForwarderBot Commands*\n\n*/help* - Show this help message\n");

        if is_privileged {
            help.push_str("\n*Recipient Management:*\n");
            help.push_str("*/addrecipient <chat_id>* - Add a recipient\n");
            help.push_str("*/delrecipient <chat_id>* - Remove a recipient\n");
            help.push_str("*/listrecipient* - List all recipients\n");

            help.push_str("\n*Admin Management:*\n");
            if is_manager {
                help.push_str("*/addadmin <user_id>* - Add an admin (Manager only)\n");
                help.push_str("*/deladmin <user_id>* - Remove an admin (Manager only)\n");
            }
            help.push_str("*/listadmins* - List all admins\n");

            help.push_str("\n*Statistics:*\n*/stats* - View bot statistics\n");
        }

        help.push_str("\n*Blacklist Management:*\n");
        if !pure_guest {
            help.push_str("*/ban* - Ban a guest (reply to their message)\n");
        }
        help.push_str(
            "*/unban* - Unban a guest (reply to their message, or use directly to request unban for yourself)\n",
        );

        help.push_str("\n*How it works:*\n");
        help.push_str("1. Guests send messages to this bot\n");
        help.push_str("2. Messages are forwarded to all recipients\n");
        help.push_str("3. Recipients can reply to forward messages back to guests");

        transport.send_markdown(msg.chat_id, &help).await?;
        Ok(())
    }

    async fn cmd_stats(&self, transport: &Arc<dyn BotTransport>, msg: &MessageUpdate) -> Result<()> {
        let stats = match self.stats.for_bot(self.bot_id) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(bot_id = %self.bot_id, error = %e, "failed to get statistics");
                transport
                    .send_text(
                        msg.chat_id,
                        "Failed to retrieve statistics. Please try again later.",
                    )
                    .await?;
                return Err(e);
            }
        };

        let text = format!(
            "*Bot Statistics*\n\n\
             Inbound Messages: {}\n\
             Outbound Messages: {}\n\
             Total Guests: {}",
            stats.inbound, stats.outbound, stats.guests,
        );
        transport.send_markdown(msg.chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_add_recipient(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
        args: &str,
    ) -> Result<()> {
        let Some(chat_id) = parse_chat_arg(args) else {
            transport
                .send_text(
                    msg.chat_id,
                    "Usage: /addrecipient <chat_id>\nExample: /addrecipient 123456789",
                )
                .await?;
            return Ok(());
        };

        // Positive ids are users, negative ids are group chats.
        let kind = if chat_id < 0 {
            RecipientKind::Group
        } else {
            RecipientKind::User
        };

        let recipient = match self.store.add_recipient(self.bot_id, kind, chat_id) {
            Ok(recipient) => recipient,
            Err(fwdbot_store::StoreError::Conflict(_)) => {
                transport
                    .send_text(msg.chat_id, "This recipient is already added.")
                    .await?;
                return Ok(());
            }
            Err(e) => {
                tracing::error!(bot_id = %self.bot_id, error = %e, "failed to create recipient");
                transport
                    .send_text(msg.chat_id, "Failed to add recipient. Please try again later.")
                    .await?;
                return Err(e.into());
            }
        };

        self.audit(
            msg.user_id.0,
            AuditAction::AddRecipient,
            "recipient",
            recipient.id,
            serde_json::json!({ "chat_id": chat_id, "kind": kind.as_str() }),
        );

        transport
            .send_text(
                msg.chat_id,
                &format!("Recipient {chat_id} has been added successfully!"),
            )
            .await?;
        Ok(())
    }

    async fn cmd_del_recipient(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
        args: &str,
    ) -> Result<()> {
        let Some(chat_id) = parse_chat_arg(args) else {
            transport
                .send_text(
                    msg.chat_id,
                    "Usage: /delrecipient <chat_id>\nExample: /delrecipient 123456789",
                )
                .await?;
            return Ok(());
        };

        let recipient = match self.store.recipient_by_chat(self.bot_id, chat_id) {
            Ok(recipient) => recipient,
            Err(fwdbot_store::StoreError::NotFound) => {
                transport.send_text(msg.chat_id, "Recipient not found.").await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.store.remove_recipient(recipient.id)?;
        self.audit(
            msg.user_id.0,
            AuditAction::DelRecipient,
            "recipient",
            recipient.id,
            serde_json::json!({ "chat_id": chat_id }),
        );

        transport
            .send_text(
                msg.chat_id,
                &format!("Recipient {chat_id} has been removed successfully!"),
            )
            .await?;
        Ok(())
    }

    async fn cmd_list_recipients(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<()> {
        let recipients = self.store.recipients_for_bot(self.bot_id)?;
        if recipients.is_empty() {
            transport.send_text(msg.chat_id, "No recipients configured.").await?;
            return Ok(());
        }

        let mut text = String::from("*Recipients:*\n\n");
        for (i, recipient) in recipients.iter().enumerate() {
            text.push_str(&format!(
                "{}. {}: {}\n",
                i + 1,
                recipient.kind.as_str(),
                recipient.chat_id
            ));
        }
        transport.send_markdown(msg.chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_add_admin(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
        args: &str,
    ) -> Result<()> {
        let Some(admin_user_id) = parse_chat_arg(args) else {
            transport
                .send_text(
                    msg.chat_id,
                    "Usage: /addadmin <user_id>\nExample: /addadmin 123456789",
                )
                .await?;
            return Ok(());
        };

        let admin_user = self.store.get_or_create_user(admin_user_id, None)?;

        let admin = match self.store.add_admin(self.bot_id, admin_user.id) {
            Ok(admin) => admin,
            Err(fwdbot_store::StoreError::Conflict(_)) => {
                transport
                    .send_text(msg.chat_id, "This user is already an admin.")
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.audit(
            msg.user_id.0,
            AuditAction::AddAdmin,
            "admin",
            admin.id,
            serde_json::json!({ "admin_user_id": admin_user_id }),
        );

        transport
            .send_text(
                msg.chat_id,
                &format!("User {admin_user_id} has been added as admin successfully!"),
            )
            .await?;
        Ok(())
    }

    async fn cmd_del_admin(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
        args: &str,
    ) -> Result<()> {
        let Some(admin_user_id) = parse_chat_arg(args) else {
            transport
                .send_text(
                    msg.chat_id,
                    "Usage: /deladmin <user_id>\nExample: /deladmin 123456789",
                )
                .await?;
            return Ok(());
        };

        let admin_user = match self.store.user_by_telegram_id(admin_user_id) {
            Ok(user) => user,
            Err(fwdbot_store::StoreError::NotFound) => {
                transport.send_text(msg.chat_id, "User not found.").await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !self.store.remove_admin(self.bot_id, admin_user.id)? {
            transport
                .send_text(msg.chat_id, "This user is not an admin.")
                .await?;
            return Ok(());
        }

        self.audit(
            msg.user_id.0,
            AuditAction::DelAdmin,
            "admin",
            admin_user.id,
            serde_json::json!({ "admin_user_id": admin_user_id }),
        );

        transport
            .send_text(
                msg.chat_id,
                &format!("User {admin_user_id} has been removed from admins successfully!"),
            )
            .await?;
        Ok(())
    }

    async fn cmd_list_admins(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<()> {
        let admins = self.store.admin_users_for_bot(self.bot_id)?;
        if admins.is_empty() {
            transport.send_text(msg.chat_id, "No admins configured.").await?;
            return Ok(());
        }

        let mut text = String::from("*Admins:*\n\n");
        for (i, admin) in admins.iter().enumerate() {
            let username = admin.username.as_deref().unwrap_or("Unknown");
            text.push_str(&format!(
                "{}. @{} ({})\n",
                i + 1,
                escape_markdown(username),
                admin.telegram_user_id
            ));
        }
        transport.send_markdown(msg.chat_id, &text).await?;
        Ok(())
    }

    // ----- moderation -----

    /// Resolves the guest a replied-to forwarded message belongs to, and
    /// checks the issuer may moderate here: manager, admin, or any member
    /// of a group-recipient chat.
    async fn moderation_context(
        &self,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<Option<i64>> {
        let Some(reply_to) = msg.reply_to else {
            return Ok(None);
        };

        let recipient = match self.store.recipient_by_chat(self.bot_id, msg.chat_id.0) {
            Ok(recipient) => recipient,
            Err(fwdbot_store::StoreError::NotFound) => {
                transport
                    .send_text(msg.chat_id, "This command can only be used in recipient chats.")
                    .await?;
                return Err(Error::Validation("not a recipient chat".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mapping = match self.store.mapping_by_recipient_message(
            self.bot_id,
            msg.chat_id.0,
            reply_to.message_id.0 as i64,
        ) {
            Ok(mapping) => mapping,
            Err(fwdbot_store::StoreError::NotFound) => {
                transport
                    .send_text(
                        msg.chat_id,
                        "Failed to find the corresponding guest. Please make sure you are replying to a forwarded message.",
                    )
                    .await?;
                return Err(Error::Validation("no mapping for replied message".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if !self.is_manager_or_admin(msg.user_id.0) && recipient.kind != RecipientKind::Group {
            transport
                .send_text(msg.chat_id, "You are not authorized to use this command.")
                .await?;
            return Err(Error::Unauthorized("moderation requires a role or a group chat".to_string()));
        }

        // Guests are always private chats, so the guest chat id is the
        // guest's user id.
        Ok(Some(mapping.guest_chat_id))
    }

    async fn cmd_ban(
        &self,
        _cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<()> {
        let Some(guest_user_id) = self.moderation_context(transport, msg).await? else {
            transport
                .send_text(
                    msg.chat_id,
                    "Please reply to a message from the user you want to ban.",
                )
                .await?;
            return Ok(());
        };

        let requester = self
            .store
            .get_or_create_user(msg.user_id.0, msg.username.as_deref())?;

        let entry = match self
            .blacklist
            .create_ban_request(self.bot_id, guest_user_id, requester.id)
        {
            Ok(entry) => entry,
            Err(Error::Validation(reason)) => {
                transport.send_text(msg.chat_id, &reason).await?;
                return Ok(());
            }
            Err(e) => {
                tracing::error!(bot_id = %self.bot_id, error = %e, "failed to create ban request");
                transport
                    .send_text(msg.chat_id, "Failed to create ban request. Please try again later.")
                    .await?;
                return Err(e);
            }
        };

        let prompt = format!(
            "*Ban Request*\n\n\
             Guest User ID: `{guest_user_id}`\n\
             Requested by: `{}`\n\
             Chat: `{}`",
            msg.user_id.0, msg.chat_id.0,
        );
        if let Err(e) = self
            .approvals
            .send_request(transport, self.bot_id, &entry, &prompt)
            .await
        {
            tracing::warn!(bot_id = %self.bot_id, error = %e, "failed to send approval request");
        }

        transport
            .send_text(
                msg.chat_id,
                "Ban request has been sent to the manager for approval.",
            )
            .await?;
        Ok(())
    }

    async fn cmd_unban(
        &self,
        _cancel: &CancellationToken,
        transport: &Arc<dyn BotTransport>,
        msg: &MessageUpdate,
    ) -> Result<()> {
        let (guest_user_id, self_request) = if msg.reply_to.is_some() {
            match self.moderation_context(transport, msg).await? {
                Some(guest) => (guest, false),
                None => return Ok(()),
            }
        } else {
            // Self-unban: only meaningful for a currently blocked guest.
            match self.blacklist.is_blacklisted(self.bot_id, msg.user_id.0) {
                Ok(true) => (msg.user_id.0, true),
                Ok(false) => {
                    transport
                        .send_text(msg.chat_id, "You are not currently blacklisted.")
                        .await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(bot_id = %self.bot_id, error = %e, "failed to check blacklist status");
                    transport
                        .send_text(
                            msg.chat_id,
                            "An error occurred while checking your status. Please try again later.",
                        )
                        .await?;
                    return Err(e);
                }
            }
        };

        let requester = self
            .store
            .get_or_create_user(msg.user_id.0, msg.username.as_deref())?;

        let entry = match self
            .blacklist
            .create_unban_request(self.bot_id, guest_user_id, requester.id)
        {
            Ok(entry) => entry,
            Err(Error::Validation(reason)) => {
                transport.send_text(msg.chat_id, &reason).await?;
                return Ok(());
            }
            Err(e) => {
                tracing::error!(bot_id = %self.bot_id, error = %e, "failed to create unban request");
                transport
                    .send_text(
                        msg.chat_id,
                        "Failed to create unban request. Please try again later.",
                    )
                    .await?;
                return Err(e);
            }
        };

        let prompt = if self_request {
            format!(
                "*Unban Request (Self-Request)*\n\n\
                 Guest User ID: `{guest_user_id}`\n\
                 Requested by: `{}`\n\
                 *Note:* This is a self-request to remove blacklist status.",
                msg.user_id.0,
            )
        } else {
            format!(
                "*Unban Request*\n\n\
                 Guest User ID: `{guest_user_id}`\n\
                 Requested by: `{}`\n\
                 Chat: `{}`",
                msg.user_id.0, msg.chat_id.0,
            )
        };
        if let Err(e) = self
            .approvals
            .send_request(transport, self.bot_id, &entry, &prompt)
            .await
        {
            tracing::warn!(bot_id = %self.bot_id, error = %e, "failed to send approval request");
        }

        let response = if self_request {
            "Your unban request has been sent to the manager for approval. It will be automatically approved after 24 hours if not manually reviewed."
        } else {
            "Unban request has been sent to the manager for approval."
        };
        transport.send_text(msg.chat_id, response).await?;
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
            CallbackAction::BlacklistDecision { entry_id, approve } => {
                if !self.is_manager_or_admin(cb.user_id.0) {
                    transport
                        .answer_callback(
                            &cb.callback_id,
                            Some("Only the manager or admin can approve/reject requests"),
                        )
                        .await?;
                    return Ok(());
                }

                let actor = self
                    .store
                    .get_or_create_user(cb.user_id.0, cb.username.as_deref())?;

                transport.answer_callback(&cb.callback_id, None).await?;

                match self
                    .approvals
                    .handle_decision(transport, entry_id, approve, &actor)
                    .await
                {
                    Ok(DecisionOutcome::Applied) => Ok(()),
                    Ok(DecisionOutcome::AlreadyDecided) => {
                        tracing::debug!(entry_id = %entry_id, "decision ignored, entry already decided");
                        Ok(())
                    }
                    Err(e) if e.is_not_found() => {
                        transport
                            .answer_callback(&cb.callback_id, Some("Blacklist request not found"))
                            .await?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            CallbackAction::BlacklistStatus(_) => {
                // Inert button on an already-decided prompt.
                transport.answer_callback(&cb.callback_id, None).await?;
                Ok(())
            }
            _ => {
                transport
                    .answer_callback(&cb.callback_id, Some("Unknown action"))
                    .await?;
                Ok(())
            }
        }
    }

    fn audit(
        &self,
        actor_telegram_id: i64,
        action: AuditAction,
        resource_type: &str,
        resource_id: Uuid,
        details: serde_json::Value,
    ) {
        let actor = self
            .store
            .user_by_telegram_id(actor_telegram_id)
            .map(|u| u.id)
            .ok();
        if let Err(e) = self
            .store
            .insert_audit(actor, action, resource_type, resource_id, details)
        {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
    }
}

fn parse_chat_arg(args: &str) -> Option<i64> {
    args.split_whitespace().next()?.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, MessageRef, UserId};
    use crate::health::RecipientMonitor;
    use crate::notify::{ErrorNotifier, ManagerNotifier};
    use crate::ratelimit::RateLimiter;
    use crate::retry::RetryPolicy;
    use crate::testing::MockTransport;
    use fwdbot_store::models::Direction;
    use std::time::Duration;

    const MANAGER_TG: i64 = 1000;
    const ADMIN_TG: i64 = 2000;
    const GUEST_TG: i64 = 500;
    const GROUP_CHAT: i64 = -100;

    struct Fixture {
        service: ForwarderService,
        store: Store,
        bot: Uuid,
        tenant: Arc<MockTransport>,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let manager = store.get_or_create_user(MANAGER_TG, Some("mgr")).unwrap();
        let bot = store.register_bot("c", "testbot", manager.id, MANAGER_TG).unwrap().id;
        let admin = store.get_or_create_user(ADMIN_TG, Some("adm")).unwrap();
        store.add_admin(bot, admin.id).unwrap();
        store
            .add_recipient(bot, RecipientKind::Group, GROUP_CHAT)
            .unwrap();

        let tenant = Arc::new(MockTransport::new());
        let manager_transport: Arc<dyn BotTransport> = Arc::new(MockTransport::new());

        let forwarder = Arc::new(Forwarder::new(
            store.clone(),
            Arc::new(RateLimiter::new(100, 100, None)),
            RetryPolicy::new(2, Duration::from_millis(1)),
            Arc::new(RecipientMonitor::new(store.clone())),
            Arc::new(ErrorNotifier::new(manager_transport.clone(), vec![1])),
            Arc::new(ManagerNotifier::new(manager_transport, store.clone())),
        ));

        let service = ForwarderService::new(
            bot,
            store.clone(),
            forwarder,
            Arc::new(BlacklistEngine::new(store.clone())),
            Arc::new(ApprovalFlow::new(store.clone())),
            Arc::new(StatsService::new(store.clone())),
        );

        Fixture {
            service,
            store,
            bot,
            tenant,
            cancel: CancellationToken::new(),
        }
    }

    fn guest_msg(message_id: i32) -> IncomingUpdate {
        IncomingUpdate::Message(MessageUpdate {
            chat_id: ChatId(GUEST_TG),
            user_id: UserId(GUEST_TG),
            username: None,
            message_id: MessageId(message_id),
            text: Some("hello".to_string()),
            reply_to: None,
        })
    }

    fn command(chat: i64, user: i64, text: &str) -> IncomingUpdate {
        IncomingUpdate::Message(MessageUpdate {
            chat_id: ChatId(chat),
            user_id: UserId(user),
            username: Some(if user == ADMIN_TG { "adm" } else { "someone" }.to_string()),
            message_id: MessageId(1),
            text: Some(text.to_string()),
            reply_to: None,
        })
    }

    async fn dispatch(f: &Fixture, update: IncomingUpdate) {
        let transport: Arc<dyn BotTransport> = f.tenant.clone();
        f.service.handle_update(&f.cancel, &transport, update).await;
    }

    #[tokio::test]
    async fn pending_ban_blocks_during_review() {
        let f = fixture();
        // Keep the group as the only recipient so the mapping is easy to
        // address from the reply.
        let seed = f.store.recipient_by_chat(f.bot, MANAGER_TG).unwrap();
        f.store.remove_recipient(seed.id).unwrap();

        // First guest message fans out.
        dispatch(&f, guest_msg(10)).await;
        assert_eq!(f.store.mapping_count(f.bot, Direction::Inbound).unwrap(), 1);
        let inbound = f
            .store
            .mapping_by_guest_message(f.bot, GUEST_TG, 10)
            .unwrap();
        assert_eq!(inbound.recipient_chat_id, GROUP_CHAT);

        // An operator replies /ban to the forwarded copy in the group.
        let ban = IncomingUpdate::Message(MessageUpdate {
            chat_id: ChatId(GROUP_CHAT),
            user_id: UserId(ADMIN_TG),
            username: Some("adm".to_string()),
            message_id: MessageId(50),
            text: Some("/ban".to_string()),
            reply_to: Some(MessageRef {
                chat_id: ChatId(GROUP_CHAT),
                message_id: MessageId(inbound.recipient_message_id as i32),
            }),
        });
        dispatch(&f, ban).await;

        // The request is pending, nobody approved yet.
        let pending = f.store.pending_blacklist_for_bot(f.bot).unwrap();
        assert_eq!(pending.len(), 1);

        // The guest's next message is dropped without forwarding.
        dispatch(&f, guest_msg(11)).await;
        assert_eq!(f.store.mapping_count(f.bot, Direction::Inbound).unwrap(), 1);
    }

    #[tokio::test]
    async fn self_unban_requires_being_blacklisted() {
        let f = fixture();

        dispatch(&f, command(GUEST_TG, GUEST_TG, "/unban")).await;
        let replies = f.tenant.sent_to(ChatId(GUEST_TG));
        assert_eq!(replies.len(), 1);
        assert!(replies[0].text.contains("not currently blacklisted"));
        assert!(f.store.pending_blacklist_for_bot(f.bot).unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_unban_opens_request_for_banned_guest() {
        let f = fixture();

        // Ban the guest (pending is already effective).
        let requester = f.store.user_by_telegram_id(MANAGER_TG).unwrap();
        f.service
            .blacklist
            .create_ban_request(f.bot, GUEST_TG, requester.id)
            .unwrap();

        dispatch(&f, command(GUEST_TG, GUEST_TG, "/unban")).await;

        // Refused by the gate: latest is ban pending, unban not admitted.
        let replies = f.tenant.sent_to(ChatId(GUEST_TG));
        assert!(replies
            .iter()
            .any(|m| m.text.contains("cannot request unban")));

        // After the ban is decided, the self-unban goes through.
        let entry = f.store.pending_blacklist_for_bot(f.bot).unwrap()[0].clone();
        let actor = f.store.user_by_telegram_id(MANAGER_TG).unwrap();
        let transport: Arc<dyn BotTransport> = f.tenant.clone();
        f.service
            .approvals
            .handle_decision(&transport, entry.id, true, &actor)
            .await
            .unwrap();

        dispatch(&f, command(GUEST_TG, GUEST_TG, "/unban")).await;
        let pending = f.store.pending_blacklist_for_bot(f.bot).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_kind, fwdbot_store::models::RequestKind::Unban);

        let replies = f.tenant.sent_to(ChatId(GUEST_TG));
        assert!(replies
            .iter()
            .any(|m| m.text.contains("automatically approved after 24 hours")));
    }

    #[tokio::test]
    async fn role_gates_hold() {
        let f = fixture();

        // A random user cannot add recipients.
        dispatch(&f, command(GUEST_TG, GUEST_TG, "/addrecipient 123")).await;
        let replies = f.tenant.sent_to(ChatId(GUEST_TG));
        assert!(replies[0].text.contains("not authorized"));

        // An admin can.
        dispatch(&f, command(ADMIN_TG, ADMIN_TG, "/addrecipient 123")).await;
        assert!(f.store.recipient_by_chat(f.bot, 123).is_ok());

        // But an admin cannot grant admin.
        dispatch(&f, command(ADMIN_TG, ADMIN_TG, "/addadmin 3000")).await;
        let replies = f.tenant.sent_to(ChatId(ADMIN_TG));
        assert!(replies
            .iter()
            .any(|m| m.text.contains("Only the manager")));

        // The manager can.
        dispatch(&f, command(MANAGER_TG, MANAGER_TG, "/addadmin 3000")).await;
        let new_admin = f.store.user_by_telegram_id(3000).unwrap();
        assert!(f.store.is_admin(f.bot, new_admin.id).unwrap());
    }

    #[tokio::test]
    async fn unknown_command_gets_help_pointer() {
        let f = fixture();
        dispatch(&f, command(GUEST_TG, GUEST_TG, "/frobnicate")).await;
        let replies = f.tenant.sent_to(ChatId(GUEST_TG));
        assert!(replies[0].text.contains("Unknown command"));
    }

    #[tokio::test]
    async fn malformed_callback_is_answered_with_toast() {
        let f = fixture();
        let cb = IncomingUpdate::Callback(CallbackUpdate {
            callback_id: "cb1".to_string(),
            user_id: UserId(MANAGER_TG),
            username: None,
            chat_id: Some(ChatId(MANAGER_TG)),
            message: None,
            data: "garbage:!!".to_string(),
        });
        dispatch(&f, cb).await;

        let answers = f.tenant.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].1.as_deref(), Some("Invalid callback data"));
    }

    #[tokio::test]
    async fn decision_callback_requires_role() {
        let f = fixture();
        let requester = f.store.user_by_telegram_id(MANAGER_TG).unwrap();
        let entry = f
            .service
            .blacklist
            .create_ban_request(f.bot, GUEST_TG, requester.id)
            .unwrap();

        let cb = IncomingUpdate::Callback(CallbackUpdate {
            callback_id: "cb2".to_string(),
            user_id: UserId(GUEST_TG),
            username: None,
            chat_id: Some(ChatId(GUEST_TG)),
            message: None,
            data: CallbackAction::BlacklistDecision {
                entry_id: entry.id,
                approve: true,
            }
            .encode(),
        });
        dispatch(&f, cb).await;

        let answers = f.tenant.answers();
        assert!(answers[0].1.as_deref().unwrap().contains("manager or admin"));
        // Still pending.
        assert_eq!(f.store.pending_blacklist_for_bot(f.bot).unwrap().len(), 1);
    }
}
