//! Cross-platform incoming update model.
//!
//! Platform-specific shapes stay in the adapter; services only ever see
//! these types.

use crate::domain::{ChatId, MessageId, MessageRef, UserId};

#[derive(Clone, Debug)]
pub enum IncomingUpdate {
    Message(MessageUpdate),
    Callback(CallbackUpdate),
}

#[derive(Clone, Debug)]
pub struct MessageUpdate {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub message_id: MessageId,
    pub text: Option<String>,
    /// The message this one replies to, when present (same chat).
    pub reply_to: Option<MessageRef>,
}

#[derive(Clone, Debug)]
pub struct CallbackUpdate {
    pub callback_id: String,
    pub user_id: UserId,
    pub username: Option<String>,
    pub chat_id: Option<ChatId>,
    /// The message carrying the pressed keyboard, when still accessible.
    pub message: Option<MessageRef>,
    pub data: String,
}

impl MessageUpdate {
    /// Splits `/cmd@botname arg1 arg2` into a lowercase command name and
    /// the raw argument tail. Returns `None` for non-command text.
    pub fn command(&self) -> Option<(String, String)> {
        let text = self.text.as_deref()?.trim();
        if !text.starts_with('/') {
            return None;
        }

        let mut parts = text.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("").trim();
        let rest = parts.next().unwrap_or("").trim().to_string();

        let cmd = first
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();

        if cmd.is_empty() {
            return None;
        }
        Some((cmd, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> MessageUpdate {
        MessageUpdate {
            chat_id: ChatId(1),
            user_id: UserId(2),
            username: None,
            message_id: MessageId(3),
            text: Some(text.to_string()),
            reply_to: None,
        }
    }

    #[test]
    fn command_parsing() {
        assert_eq!(
            msg("/addbot 123:abc").command(),
            Some(("addbot".to_string(), "123:abc".to_string()))
        );
        assert_eq!(
            msg("/HELP@SomeBot").command(),
            Some(("help".to_string(), String::new()))
        );
        assert_eq!(msg("hello").command(), None);
        assert_eq!(msg("/").command(), None);
    }
}
