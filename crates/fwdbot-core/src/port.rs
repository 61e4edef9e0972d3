//! Platform ports.
//!
//! Telegram is the first implementation; the shape is kept narrow enough
//! that any platform with long-poll updates, message forwarding and
//! editable inline keyboards can sit behind it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{ChatId, MessageId, MessageRef};
use crate::update::IncomingUpdate;
use crate::Result;

/// Identity of a credential as reported by the platform.
#[derive(Clone, Debug)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
}

#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub command: &'static str,
    pub description: &'static str,
}

/// Inline keyboard rows for interactive prompts.
#[derive(Clone, Debug, Default)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

#[derive(Clone, Debug)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn row(buttons: Vec<InlineButton>) -> Self {
        Self {
            rows: vec![buttons],
        }
    }

    pub fn one_per_row(buttons: Vec<InlineButton>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }
}

impl InlineButton {
    pub fn new(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Outbound platform operations for one bot credential.
#[async_trait]
pub trait BotTransport: Send + Sync {
    async fn identity(&self) -> Result<BotIdentity>;

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;

    /// Markdown parse mode; callers escape user-controlled fragments.
    async fn send_markdown(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;

    async fn send_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn edit_markdown(
        &self,
        msg: MessageRef,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<()>;

    async fn forward_message(
        &self,
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<MessageRef>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    /// Probes a chat's existence; the health monitor classifies failures.
    async fn get_chat(&self, chat_id: ChatId) -> Result<()>;

    async fn set_command_menu(&self, commands: &[CommandSpec]) -> Result<()>;
}

/// Long-poll update source for one bot credential.
#[async_trait]
pub trait UpdateSource: Send {
    /// Next update, or `None` once `cancel` fires. Implementations drop
    /// updates that accumulated while the bot was offline.
    async fn next(&mut self, cancel: &CancellationToken) -> Option<IncomingUpdate>;
}

/// Builds a transport + update source from a decrypted credential.
/// The supervisor uses this to bring tenant bots up at runtime.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, token: &str) -> Result<BotConnection>;
}

pub struct BotConnection {
    pub transport: Arc<dyn BotTransport>,
    pub updates: Box<dyn UpdateSource>,
}
