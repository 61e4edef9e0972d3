//! Bot supervisor: lifecycle of the ForwarderBot long-poll loops.
//!
//! One handle per running bot in a map behind a read-write lock.
//! `start`/`stop` are idempotent; one bot's failure never touches its
//! siblings; shutdown cancels and awaits every loop. A panicking update
//! handler is caught, reported and the loop keeps polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use fwdbot_store::Store;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::ApprovalFlow;
use crate::blacklist::BlacklistEngine;
use crate::forwarder::ForwarderService;
use crate::health::RecipientMonitor;
use crate::notify::{ErrorKind, ErrorNotifier};
use crate::pipeline::Forwarder;
use crate::port::{BotTransport, TransportFactory, UpdateSource};
use crate::stats::StatsService;
use crate::vault::TokenVault;
use crate::{errors::Error, Result};

pub struct SupervisorDeps {
    pub store: Store,
    pub vault: Arc<TokenVault>,
    pub factory: Arc<dyn TransportFactory>,
    pub forwarder: Arc<Forwarder>,
    pub blacklist: Arc<BlacklistEngine>,
    pub approvals: Arc<ApprovalFlow>,
    pub stats: Arc<StatsService>,
    pub error_notifier: Arc<ErrorNotifier>,
    pub monitor: Arc<RecipientMonitor>,
    /// Recipient health sweep period; injectable for tests.
    pub sweep_interval: Duration,
}

struct BotHandle {
    cancel: CancellationToken,
    poll: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

pub struct BotSupervisor {
    deps: SupervisorDeps,
    bots: RwLock<HashMap<Uuid, BotHandle>>,
    root_cancel: CancellationToken,
}

impl BotSupervisor {
    pub fn new(deps: SupervisorDeps, root_cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            deps,
            bots: RwLock::new(HashMap::new()),
            root_cancel,
        })
    }

    /// Starts every persisted bot. One bot's failure is logged and
    /// surfaced to superusers, then loading continues with its siblings.
    pub async fn load_all(self: &Arc<Self>) -> Result<()> {
        let records = self.deps.store.all_bots()?;
        tracing::debug!(bot_count = records.len(), "loading ForwarderBots from store");

        for record in records {
            if let Err(e) = self.start(record.id).await {
                tracing::warn!(bot_id = %record.id, error = %e, "failed to start bot");
                let kind = classify_start_failure(&e);
                self.deps
                    .error_notifier
                    .notify(kind, &e.to_string(), &format!("failed to start bot {}", record.id))
                    .await;
            }
        }

        let running = self.bots.read().await.len();
        tracing::info!(total_bots = running, "loaded ForwarderBots");
        Ok(())
    }

    /// Idempotent start. On return the bot is visible as running: its
    /// long-poll loop and health sweep are spawned.
    pub async fn start(self: &Arc<Self>, bot_id: Uuid) -> Result<()> {
        let mut bots = self.bots.write().await;
        if bots.contains_key(&bot_id) {
            tracing::debug!(bot_id = %bot_id, "bot is already running");
            return Ok(());
        }

        let record = self.deps.store.bot_by_id(bot_id)?;
        let token = self.deps.vault.decrypt(&record.token)?;
        let connection = self.deps.factory.connect(&token).await?;

        let service = Arc::new(ForwarderService::new(
            bot_id,
            self.deps.store.clone(),
            self.deps.forwarder.clone(),
            self.deps.blacklist.clone(),
            self.deps.approvals.clone(),
            self.deps.stats.clone(),
        ));

        let cancel = self.root_cancel.child_token();
        let poll = tokio::spawn(run_bot_loop(
            service,
            connection.transport.clone(),
            connection.updates,
            cancel.clone(),
            self.deps.error_notifier.clone(),
        ));
        let sweep = tokio::spawn(self.deps.monitor.clone().run_periodic(
            connection.transport,
            bot_id,
            cancel.clone(),
            self.deps.sweep_interval,
        ));

        bots.insert(
            bot_id,
            BotHandle {
                cancel,
                poll,
                sweep,
            },
        );

        tracing::info!(bot_id = %bot_id, bot_name = %record.name, "ForwarderBot started");
        Ok(())
    }

    /// Idempotent stop: signals the loop, awaits it, releases the handle.
    pub async fn stop(&self, bot_id: Uuid) {
        let handle = self.bots.write().await.remove(&bot_id);
        let Some(handle) = handle else {
            tracing::debug!(bot_id = %bot_id, "bot is not running");
            return;
        };

        handle.cancel.cancel();
        let _ = handle.poll.await;
        let _ = handle.sweep.await;

        tracing::info!(bot_id = %bot_id, "ForwarderBot stopped");
    }

    /// Concurrent stop of every bot; awaited by process shutdown.
    pub async fn stop_all(&self) {
        let handles: Vec<(Uuid, BotHandle)> = self.bots.write().await.drain().collect();
        tracing::debug!(bot_count = handles.len(), "stopping all ForwarderBots");

        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (bot_id, handle) in handles {
            let _ = handle.poll.await;
            let _ = handle.sweep.await;
            tracing::debug!(bot_id = %bot_id, "ForwarderBot stopped");
        }
    }

    pub async fn is_running(&self, bot_id: Uuid) -> bool {
        self.bots.read().await.contains_key(&bot_id)
    }

    pub async fn running_count(&self) -> usize {
        self.bots.read().await.len()
    }
}

async fn run_bot_loop(
    service: Arc<ForwarderService>,
    transport: Arc<dyn BotTransport>,
    mut updates: Box<dyn UpdateSource>,
    cancel: CancellationToken,
    error_notifier: Arc<ErrorNotifier>,
) {
    let bot_id = service.bot_id();

    while let Some(update) = updates.next(&cancel).await {
        let handled = std::panic::AssertUnwindSafe(service.handle_update(&cancel, &transport, update))
            .catch_unwind()
            .await;

        if let Err(panic) = handled {
            let description = panic_description(panic);
            tracing::error!(bot_id = %bot_id, panic = %description, "update handler panicked");
            error_notifier
                .notify(
                    ErrorKind::SystemPanic,
                    &description,
                    &format!("update handler for bot {bot_id}"),
                )
                .await;
            // The offending update is abandoned; the loop keeps polling.
        }
    }

    tracing::debug!(bot_id = %bot_id, "long-poll loop exited");
}

fn panic_description(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn classify_start_failure(e: &Error) -> ErrorKind {
    if e.is_credential_invalid() || matches!(e, Error::Crypto(_)) {
        ErrorKind::CredentialInvalid
    } else if matches!(e, Error::Store(_)) {
        ErrorKind::Database
    } else {
        ErrorKind::SystemPanic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ManagerNotifier;
    use crate::ratelimit::RateLimiter;
    use crate::retry::RetryPolicy;
    use crate::testing::{MockFactory, MockTransport};

    struct Fixture {
        supervisor: Arc<BotSupervisor>,
        store: Store,
        vault: Arc<TokenVault>,
        factory: Arc<MockFactory>,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let vault = Arc::new(TokenVault::new(&[7u8; 32]));
        let factory = Arc::new(MockFactory::new());

        let manager_transport: Arc<dyn BotTransport> = Arc::new(MockTransport::new());
        let error_notifier = Arc::new(ErrorNotifier::new(manager_transport.clone(), vec![1]));
        let monitor = Arc::new(RecipientMonitor::new(store.clone()));
        let forwarder = Arc::new(Forwarder::new(
            store.clone(),
            Arc::new(RateLimiter::new(100, 100, None)),
            RetryPolicy::new(2, Duration::from_millis(1)),
            monitor.clone(),
            error_notifier.clone(),
            Arc::new(ManagerNotifier::new(manager_transport, store.clone())),
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

        Fixture {
            supervisor,
            store,
            vault,
            factory,
        }
    }

    fn seed_bot(f: &Fixture, token: &str, name: &str, manager_tg: i64) -> Uuid {
        let mgr = f.store.get_or_create_user(manager_tg, None).unwrap().id;
        let ciphertext = f.vault.encrypt(token).unwrap();
        f.store
            .register_bot(&ciphertext, name, mgr, manager_tg)
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_releases() {
        let f = fixture();
        let bot = seed_bot(&f, "token-a", "a", 1);

        f.supervisor.start(bot).await.unwrap();
        assert!(f.supervisor.is_running(bot).await);
        // Second start is a no-op; only one connection was made.
        f.supervisor.start(bot).await.unwrap();
        assert_eq!(f.factory.connection_count("token-a"), 1);

        f.supervisor.stop(bot).await;
        assert!(!f.supervisor.is_running(bot).await);
        // Stopping again is harmless.
        f.supervisor.stop(bot).await;

        // And the bot can come back.
        f.supervisor.start(bot).await.unwrap();
        assert!(f.supervisor.is_running(bot).await);
        f.supervisor.stop_all().await;
        assert_eq!(f.supervisor.running_count().await, 0);
    }

    #[tokio::test]
    async fn one_failing_bot_does_not_abort_siblings() {
        let f = fixture();
        let good = seed_bot(&f, "token-good", "good", 1);
        let bad = seed_bot(&f, "token-bad", "bad", 2);
        f.factory.fail_token("token-bad");

        f.supervisor.load_all().await.unwrap();

        assert!(f.supervisor.is_running(good).await);
        assert!(!f.supervisor.is_running(bad).await);

        f.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn updates_flow_into_the_service() {
        let f = fixture();
        let bot = seed_bot(&f, "token-a", "a", 1);
        f.supervisor.start(bot).await.unwrap();

        // Push a guest message through the factory's update channel.
        f.factory.push_update(
            "token-a",
            crate::update::IncomingUpdate::Message(crate::update::MessageUpdate {
                chat_id: crate::domain::ChatId(500),
                user_id: crate::domain::UserId(500),
                username: None,
                message_id: crate::domain::MessageId(10),
                text: Some("hello".to_string()),
                reply_to: None,
            }),
        );

        // The manager seed recipient receives the forward.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let count = f
                .store
                .mapping_count(bot, fwdbot_store::models::Direction::Inbound)
                .unwrap();
            if count == 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "forward never happened");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        f.supervisor.stop_all().await;
    }
}
