//! Out-of-band notifications.
//!
//! [`ErrorNotifier`] alerts superusers about critical failures with a
//! per-kind debounce; [`ManagerNotifier`] delivers per-bot operational
//! summaries to the owning manager through the manager bot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fwdbot_store::Store;
use uuid::Uuid;

use crate::domain::ChatId;
use crate::format::{escape_markdown, now_display};
use crate::port::BotTransport;
use crate::{errors::Error, Result};

const DEBOUNCE: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Database,
    ExternalCache,
    CredentialInvalid,
    SystemPanic,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::ExternalCache => "external_cache",
            ErrorKind::CredentialInvalid => "credential_invalid",
            ErrorKind::SystemPanic => "system_panic",
        }
    }
}

pub struct ErrorNotifier {
    transport: Arc<dyn BotTransport>,
    superusers: Vec<i64>,
    notified: Mutex<HashMap<ErrorKind, Instant>>,
}

impl ErrorNotifier {
    pub fn new(transport: Arc<dyn BotTransport>, superusers: Vec<i64>) -> Self {
        Self {
            transport,
            superusers,
            notified: Mutex::new(HashMap::new()),
        }
    }

    /// Posts a critical-error alert to every superuser, at most once per
    /// kind per hour. Send failures are logged and swallowed; alerting
    /// must never take down the caller.
    pub async fn notify(&self, kind: ErrorKind, error: &str, details: &str) {
        {
            let mut notified = self.notified.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = notified.get(&kind) {
                if last.elapsed() < DEBOUNCE {
                    tracing::debug!(kind = kind.as_str(), "error notification debounced");
                    return;
                }
            }
            notified.insert(kind, Instant::now());
        }

        let message = format!(
            "*Critical Error Alert*\n\n\
             Type: `{}`\n\
             Error: `{}`\n\
             Details: `{}`\n\
             Time: {}",
            kind.as_str(),
            escape_markdown(error),
            escape_markdown(details),
            now_display(),
        );

        for &superuser in &self.superusers {
            if let Err(e) = self
                .transport
                .send_markdown(ChatId(superuser), &message)
                .await
            {
                tracing::warn!(superuser, error = %e, "failed to send error notification");
            }
        }

        tracing::error!(kind = kind.as_str(), error, "critical error notified to superusers");
    }
}

pub struct ManagerNotifier {
    transport: Arc<dyn BotTransport>,
    store: Store,
}

impl ManagerNotifier {
    pub fn new(transport: Arc<dyn BotTransport>, store: Store) -> Self {
        Self { transport, store }
    }

    /// Sends `message` (Markdown, already escaped by the caller where it
    /// embeds user-controlled text) to the manager of `bot_id`.
    pub async fn notify_manager(&self, bot_id: Uuid, message: &str) -> Result<()> {
        let bot = self.store.bot_by_id(bot_id)?;
        let manager = self.store.user_by_id(bot.manager_id)?;

        self.transport
            .send_markdown(ChatId(manager.telegram_user_id), message)
            .await
            .map_err(|e| {
                tracing::warn!(
                    bot_id = %bot_id,
                    manager = manager.telegram_user_id,
                    error = %e,
                    "failed to notify manager"
                );
                e
            })?;

        Ok(())
    }
}

/// Convenience wrapper: report a failure only when it is a credential
/// invalidation, used by the pipeline's per-recipient failure path.
pub async fn escalate_if_credential_invalid(
    notifier: &ErrorNotifier,
    err: &Error,
    details: String,
) {
    if err.is_credential_invalid() {
        notifier
            .notify(ErrorKind::CredentialInvalid, &err.to_string(), &details)
            .await;
    }
}
