//! Long-poll update source and the transport factory.
//!
//! Each bot credential gets its own [`TelegramUpdates`] loop. Updates
//! that accumulated while the bot was offline are dropped on start, so a
//! freshly (re)started bot only sees new traffic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::{
    payloads::GetUpdatesSetters,
    prelude::*,
    requests::Request,
    types::UpdateKind,
};
use tokio_util::sync::CancellationToken;

use fwdbot_core::{
    config::ProxyConfig,
    domain::{ChatId, MessageId, MessageRef, UserId},
    port::{BotConnection, TransportFactory, UpdateSource},
    update::{CallbackUpdate, IncomingUpdate, MessageUpdate},
    Result,
};

use crate::{client, map_err, TelegramTransport};

const POLL_TIMEOUT_SECS: u32 = 25;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct TelegramUpdates {
    bot: Bot,
    offset: i32,
    synced: bool,
    buffer: VecDeque<IncomingUpdate>,
}

impl TelegramUpdates {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            offset: 0,
            synced: false,
            buffer: VecDeque::new(),
        }
    }

    /// Skip everything queued server-side so a (re)started bot does not
    /// replay stale traffic.
    async fn drop_pending(&mut self) {
        match self.bot.get_updates().offset(-1).timeout(0).send().await {
            Ok(updates) => {
                if let Some(last) = updates.last() {
                    self.offset = last.id + 1;
                }
                self.synced = true;
            }
            Err(e) => {
                tracing::warn!(error = %map_err(e), "failed to drop pending updates, will retry");
            }
        }
    }
}

#[async_trait]
impl UpdateSource for TelegramUpdates {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<IncomingUpdate> {
        loop {
            if let Some(update) = self.buffer.pop_front() {
                return Some(update);
            }
            if cancel.is_cancelled() {
                return None;
            }

            if !self.synced {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = self.drop_pending() => {}
                }
                continue;
            }

            let request = self
                .bot
                .get_updates()
                .offset(self.offset)
                .timeout(POLL_TIMEOUT_SECS)
                .send();

            let batch = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = request => result,
            };

            match batch {
                Ok(updates) => {
                    for update in updates {
                        self.offset = self.offset.max(update.id + 1);
                        if let Some(converted) = convert_update(update) {
                            self.buffer.push_back(converted);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %map_err(e), "long poll failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

fn convert_update(update: teloxide::types::Update) -> Option<IncomingUpdate> {
    match update.kind {
        UpdateKind::Message(msg) => {
            let from = msg.from()?;
            Some(IncomingUpdate::Message(MessageUpdate {
                chat_id: ChatId(msg.chat.id.0),
                user_id: UserId(from.id.0 as i64),
                username: from.username.clone(),
                message_id: MessageId(msg.id.0),
                text: msg.text().map(|t| t.to_string()),
                reply_to: msg.reply_to_message().map(|r| MessageRef {
                    chat_id: ChatId(r.chat.id.0),
                    message_id: MessageId(r.id.0),
                }),
            }))
        }
        UpdateKind::CallbackQuery(q) => {
            let message = q.message.as_ref().map(|m| MessageRef {
                chat_id: ChatId(m.chat.id.0),
                message_id: MessageId(m.id.0),
            });
            Some(IncomingUpdate::Callback(CallbackUpdate {
                callback_id: q.id,
                user_id: UserId(q.from.id.0 as i64),
                username: q.from.username.clone(),
                chat_id: message.map(|m| m.chat_id),
                message,
                data: q.data.unwrap_or_default(),
            }))
        }
        // Edited messages, channel posts, member updates and the rest are
        // irrelevant to forwarding.
        _ => None,
    }
}

/// Builds Telegram transports sharing one (optionally proxied) HTTP
/// client. The supervisor uses this to bring tenant bots up at runtime.
pub struct TelegramFactory {
    client: reqwest::Client,
}

impl TelegramFactory {
    pub fn new(proxy: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            client: client::build_client(proxy)?,
        })
    }
}

#[async_trait]
impl TransportFactory for TelegramFactory {
    async fn connect(&self, token: &str) -> Result<BotConnection> {
        let bot = Bot::with_client(token.to_string(), self.client.clone());
        Ok(BotConnection {
            transport: Arc::new(TelegramTransport::new(bot.clone())),
            updates: Box::new(TelegramUpdates::new(bot)),
        })
    }
}
