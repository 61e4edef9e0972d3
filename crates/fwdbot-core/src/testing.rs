//! Test doubles shared by the service tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{ChatId, MessageId, MessageRef};
use crate::errors::{ApiErrorKind, Error};
use crate::port::{
    BotConnection, BotIdentity, BotTransport, CommandSpec, InlineKeyboard, TransportFactory,
    UpdateSource,
};
use crate::update::IncomingUpdate;
use crate::Result;

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub keyboard: Option<InlineKeyboard>,
}

#[derive(Clone, Debug)]
pub struct ForwardCall {
    pub to: ChatId,
    pub from: ChatId,
    pub message_id: MessageId,
}

#[derive(Default)]
struct MockState {
    sent: Vec<SentMessage>,
    edits: Vec<(MessageRef, String)>,
    forwards: Vec<ForwardCall>,
    answers: Vec<(String, Option<String>)>,
    next_message_id: i32,
    /// Scripted forward failures per destination chat, consumed in order.
    forward_failures: HashMap<i64, VecDeque<(ApiErrorKind, String)>>,
    /// Chats whose get_chat probe reports "gone".
    gone_chats: HashSet<i64>,
    identity: Option<BotIdentity>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_message_id: 1000,
                ..Default::default()
            }),
        }
    }

    pub fn with_identity(id: i64, username: &str) -> Self {
        let t = Self::new();
        t.state.lock().unwrap().identity = Some(BotIdentity {
            id,
            username: username.to_string(),
        });
        t
    }

    pub fn script_forward_failure(&self, to: ChatId, kind: ApiErrorKind, message: &str) {
        self.state
            .lock()
            .unwrap()
            .forward_failures
            .entry(to.0)
            .or_default()
            .push_back((kind, message.to_string()));
    }

    pub fn mark_chat_gone(&self, chat: ChatId) {
        self.state.lock().unwrap().gone_chats.insert(chat.0);
    }

    pub fn sent_to(&self, chat: ChatId) -> Vec<SentMessage> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|m| m.chat_id == chat)
            .cloned()
            .collect()
    }

    pub fn all_sent(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn forwards(&self) -> Vec<ForwardCall> {
        self.state.lock().unwrap().forwards.clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String)> {
        self.state.lock().unwrap().edits.clone()
    }

    pub fn answers(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().unwrap().answers.clone()
    }

    fn record_send(&self, chat_id: ChatId, text: &str, keyboard: Option<InlineKeyboard>) -> MessageRef {
        let mut state = self.state.lock().unwrap();
        state.next_message_id += 1;
        let message_id = MessageId(state.next_message_id);
        state.sent.push(SentMessage {
            chat_id,
            text: text.to_string(),
            keyboard,
        });
        MessageRef {
            chat_id,
            message_id,
        }
    }
}

#[async_trait]
impl BotTransport for MockTransport {
    async fn identity(&self) -> Result<BotIdentity> {
        self.state
            .lock()
            .unwrap()
            .identity
            .clone()
            .ok_or_else(|| Error::api(ApiErrorKind::Unauthorized, "401 Unauthorized"))
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        Ok(self.record_send(chat_id, text, None))
    }

    async fn send_markdown(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        Ok(self.record_send(chat_id, text, None))
    }

    async fn send_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        Ok(self.record_send(chat_id, text, Some(keyboard)))
    }

    async fn edit_markdown(
        &self,
        msg: MessageRef,
        text: &str,
        _keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        self.state.lock().unwrap().edits.push((msg, text.to_string()));
        Ok(())
    }

    async fn forward_message(
        &self,
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
    ) -> Result<MessageRef> {
        let mut state = self.state.lock().unwrap();

        if let Some(queue) = state.forward_failures.get_mut(&to.0) {
            if let Some((kind, message)) = queue.pop_front() {
                return Err(Error::api(kind, message));
            }
        }

        state.next_message_id += 1;
        let new_id = MessageId(state.next_message_id);
        state.forwards.push(ForwardCall {
            to,
            from,
            message_id,
        });
        Ok(MessageRef {
            chat_id: to,
            message_id: new_id,
        })
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .answers
            .push((callback_id.to_string(), text.map(|s| s.to_string())));
        Ok(())
    }

    async fn get_chat(&self, chat_id: ChatId) -> Result<()> {
        if self.state.lock().unwrap().gone_chats.contains(&chat_id.0) {
            return Err(Error::api(ApiErrorKind::ChatGone, "Bad Request: chat not found"));
        }
        Ok(())
    }

    async fn set_command_menu(&self, _commands: &[CommandSpec]) -> Result<()> {
        Ok(())
    }
}

/// Update source fed from an in-memory channel.
pub struct ChannelUpdates {
    rx: mpsc::UnboundedReceiver<IncomingUpdate>,
}

#[async_trait]
impl UpdateSource for ChannelUpdates {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<IncomingUpdate> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            update = self.rx.recv() => update,
        }
    }
}

struct MockConnection {
    transport: Arc<MockTransport>,
    sender: mpsc::UnboundedSender<IncomingUpdate>,
    connects: usize,
}

/// Transport factory handing out [`MockTransport`]s, with per-token
/// scripted failures and update injection.
pub struct MockFactory {
    fail_tokens: Mutex<HashSet<String>>,
    identities: Mutex<HashMap<String, (i64, String)>>,
    connections: Mutex<HashMap<String, MockConnection>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            fail_tokens: Mutex::new(HashSet::new()),
            identities: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_token(&self, token: &str) {
        self.fail_tokens.lock().unwrap().insert(token.to_string());
    }

    /// Registers the identity the platform reports for `token`.
    pub fn set_identity(&self, token: &str, id: i64, username: &str) {
        self.identities
            .lock()
            .unwrap()
            .insert(token.to_string(), (id, username.to_string()));
    }

    pub fn connection_count(&self, token: &str) -> usize {
        self.connections
            .lock()
            .unwrap()
            .get(token)
            .map(|c| c.connects)
            .unwrap_or(0)
    }

    pub fn transport_for(&self, token: &str) -> Option<Arc<MockTransport>> {
        self.connections
            .lock()
            .unwrap()
            .get(token)
            .map(|c| c.transport.clone())
    }

    pub fn push_update(&self, token: &str, update: IncomingUpdate) {
        let connections = self.connections.lock().unwrap();
        let conn = connections.get(token).expect("no connection for token");
        conn.sender.send(update).expect("update channel closed");
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, token: &str) -> Result<BotConnection> {
        if self.fail_tokens.lock().unwrap().contains(token) {
            return Err(Error::api(ApiErrorKind::Unauthorized, "401 Unauthorized"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = match self.identities.lock().unwrap().get(token) {
            Some((id, username)) => Arc::new(MockTransport::with_identity(*id, username)),
            None => Arc::new(MockTransport::new()),
        };

        let mut connections = self.connections.lock().unwrap();
        let entry = connections
            .entry(token.to_string())
            .or_insert_with(|| MockConnection {
                transport: transport.clone(),
                sender: tx.clone(),
                connects: 0,
            });
        entry.connects += 1;
        entry.sender = tx;
        entry.transport = transport.clone();

        Ok(BotConnection {
            transport,
            updates: Box::new(ChannelUpdates { rx }),
        })
    }
}
