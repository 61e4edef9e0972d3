//! Telegram adapter (teloxide).
//!
//! Implements the core platform ports over the Telegram Bot API and maps
//! `teloxide::RequestError` into the core failure taxonomy so the retry
//! executor and health monitor can classify without touching Telegram
//! types.

use async_trait::async_trait;

use teloxide::{
    payloads::{AnswerCallbackQuerySetters, EditMessageTextSetters, SendMessageSetters},
    prelude::*,
    types::{BotCommand, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
    ApiError, RequestError,
};

use fwdbot_core::{
    domain::{ChatId, MessageId, MessageRef},
    port::{BotIdentity, CommandSpec, InlineKeyboard},
    ApiErrorKind, Error, Result,
};

pub mod client;
pub mod polling;

pub use polling::TelegramFactory;

#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn keyboard_markup(keyboard: InlineKeyboard) -> InlineKeyboardMarkup {
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|b| InlineKeyboardButton::callback(b.label, b.callback_data))
                    .collect()
            })
            .collect();
        InlineKeyboardMarkup::new(rows)
    }
}

/// Maps a teloxide failure into the core taxonomy.
pub fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::RetryAfter(after) => Error::api(
            ApiErrorKind::FloodWait,
            format!("Too Many Requests: retry after {}s", after.as_secs()),
        ),
        RequestError::Network(err) => {
            Error::api(ApiErrorKind::Network, format!("network error: {err}"))
        }
        RequestError::Io(err) => Error::api(ApiErrorKind::Network, format!("i/o error: {err}")),
        RequestError::Api(api) => classify_api(api),
        other => Error::api(ApiErrorKind::Other, other.to_string()),
    }
}

fn classify_api(api: ApiError) -> Error {
    match &api {
        ApiError::BotBlocked
        | ApiError::ChatNotFound
        | ApiError::UserNotFound
        | ApiError::GroupDeactivated
        | ApiError::UserDeactivated
        | ApiError::CantInitiateConversation => {
            Error::api(ApiErrorKind::ChatGone, api.to_string())
        }
        ApiError::Unknown(text) => classify_text(text),
        _ => classify_text(&api.to_string()),
    }
}

/// Telegram reports many terminal states only through error strings; this
/// is the same bucketing the platform's HTTP statuses imply.
fn classify_text(text: &str) -> Error {
    let lower = text.to_lowercase();

    let kind = if lower.contains("unauthorized") || lower.contains("401") {
        ApiErrorKind::Unauthorized
    } else if lower.contains("chat not found")
        || lower.contains("bot was blocked")
        || lower.contains("bot was kicked")
        || lower.contains("deactivated")
        || lower.contains("forbidden")
        || lower.contains("403")
        || lower.contains("400")
    {
        ApiErrorKind::ChatGone
    } else if lower.contains("too many requests") || lower.contains("429") {
        ApiErrorKind::FloodWait
    } else if lower.contains("internal server")
        || lower.contains("bad gateway")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        ApiErrorKind::Server
    } else {
        ApiErrorKind::Other
    };

    Error::api(kind, text.to_string())
}

#[async_trait]
impl fwdbot_core::port::BotTransport for TelegramTransport {
    async fn identity(&self) -> Result<BotIdentity> {
        let me = self.bot.get_me().await.map_err(map_err)?;
        Ok(BotIdentity {
            id: me.user.id.0 as i64,
            username: me.username().to_string(),
        })
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(Self::tg_chat(chat_id), text.to_string())
            .await
            .map_err(map_err)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_markdown(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(Self::tg_chat(chat_id), text.to_string())
            .parse_mode(ParseMode::Markdown)
            .await
            .map_err(map_err)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(Self::tg_chat(chat_id), text.to_string())
            .parse_mode(ParseMode::Markdown)
            .reply_markup(Self::keyboard_markup(keyboard))
            .await
            .map_err(map_err)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn edit_markdown(
        &self,
        msg: MessageRef,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        let mut req = self
            .bot
            .edit_message_text(
                Self::tg_chat(msg.chat_id),
                Self::tg_msg_id(msg.message_id),
                text.to_string(),
            )
            .parse_mode(ParseMode::Markdown);
        if let Some(keyboard) = keyboard {
            req = req.reply_markup(Self::keyboard_markup(keyboard));
        }
        req.await.map_err(map_err)?;
        Ok(())
    }

    async fn forward_message(
        &self,
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<MessageRef> {
        let msg = self
            .bot
            .forward_message(Self::tg_chat(to), Self::tg_chat(from), Self::tg_msg_id(message_id))
            .await
            .map_err(map_err)?;

        Ok(MessageRef {
            chat_id: to,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut req = self.bot.answer_callback_query(callback_id.to_string());
        if let Some(t) = text {
            req = req.text(t.to_string());
        }
        req.await.map_err(map_err)?;
        Ok(())
    }

    async fn get_chat(&self, chat_id: ChatId) -> Result<()> {
        self.bot
            .get_chat(Self::tg_chat(chat_id))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_command_menu(&self, commands: &[CommandSpec]) -> Result<()> {
        let commands: Vec<BotCommand> = commands
            .iter()
            .map(|c| BotCommand::new(c.command.to_string(), c.description.to_string()))
            .collect();
        self.bot
            .set_my_commands(commands)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_error_strings_are_bucketed() {
        assert!(classify_text("Unauthorized").is_credential_invalid());
        assert!(classify_text("Forbidden: bot was blocked by the user").is_chat_gone());
        assert!(classify_text("Bad Request: chat not found").is_chat_gone());
        assert!(classify_text("Too Many Requests: retry after 5").is_retryable());
        assert!(classify_text("Internal Server Error").is_retryable());
        assert!(!classify_text("message is not modified").is_retryable());
    }
}
