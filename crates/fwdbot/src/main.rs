//! Process entry point: configuration, wiring, lifecycle.
//!
//! Startup order matters: config and logging first, then the store, then
//! the optional cache (fatal when enabled and unreachable), then the
//! manager bot, then every persisted tenant bot. Shutdown cancels the
//! root token and awaits the supervisor.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use fwdbot_core::{
    approval::ApprovalFlow,
    blacklist::BlacklistEngine,
    config::Config,
    health::RecipientMonitor,
    logging,
    manager::ManagerService,
    notify::{ErrorKind, ErrorNotifier, ManagerNotifier},
    pipeline::Forwarder,
    port::{BotTransport, TransportFactory, UpdateSource},
    ratelimit::{self, RateLimiter},
    retry::RetryPolicy,
    stats::StatsService,
    supervisor::{BotSupervisor, SupervisorDeps},
    vault::TokenVault,
    Error, Result,
};
use fwdbot_store::Store;
use fwdbot_telegram::TelegramFactory;

const AUTO_APPROVE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const AUTO_APPROVE_EXPIRY_HOURS: i64 = 24;
const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const CACHE_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load()?;
    logging::init(&cfg)?;

    let key = TokenVault::key_from_config(cfg.encryption_key.as_deref(), cfg.is_production())?;
    let vault = Arc::new(TokenVault::new(&key));

    let store = Store::open(Path::new(&cfg.database_dsn)).map_err(Error::Store)?;

    let cache = if cfg.redis.enabled {
        let conn = ratelimit::connect_cache(&cfg.redis.url())
            .await
            .map_err(|e| Error::Config(format!("redis unreachable: {e}")))?;
        tracing::info!(address = %cfg.redis.address, "redis connected");
        Some(conn)
    } else {
        None
    };

    let factory: Arc<dyn TransportFactory> = Arc::new(TelegramFactory::new(&cfg.proxy)?);

    // The manager bot comes up first; everything out-of-band (alerts,
    // failure summaries) goes through it.
    let manager_conn = factory.connect(&cfg.manager_bot_token).await?;
    let manager_transport = manager_conn.transport.clone();
    let identity = manager_transport.identity().await?;
    tracing::info!(username = %identity.username, "manager bot authenticated");

    let rate_limiter = Arc::new(RateLimiter::new(
        cfg.rate_limit_telegram_api,
        cfg.rate_limit_guest_message,
        cache,
    ));
    let retry = RetryPolicy::new(cfg.retry_max_attempts, cfg.retry_interval);

    let error_notifier = Arc::new(ErrorNotifier::new(
        manager_transport.clone(),
        cfg.superusers.clone(),
    ));
    let manager_notifier = Arc::new(ManagerNotifier::new(
        manager_transport.clone(),
        store.clone(),
    ));
    let monitor = Arc::new(RecipientMonitor::new(store.clone()));
    let forwarder = Arc::new(Forwarder::new(
        store.clone(),
        rate_limiter.clone(),
        retry,
        monitor.clone(),
        error_notifier.clone(),
        manager_notifier,
    ));
    let blacklist = Arc::new(BlacklistEngine::new(store.clone()));
    let approvals = Arc::new(ApprovalFlow::new(store.clone()));
    let stats = Arc::new(StatsService::new(store.clone()));

    let root_cancel = CancellationToken::new();

    let supervisor = BotSupervisor::new(
        SupervisorDeps {
            store: store.clone(),
            vault: vault.clone(),
            factory: factory.clone(),
            forwarder,
            blacklist: blacklist.clone(),
            approvals,
            stats: stats.clone(),
            error_notifier: error_notifier.clone(),
            monitor,
            sweep_interval: HEALTH_SWEEP_INTERVAL,
        },
        root_cancel.clone(),
    );
    supervisor.load_all().await?;

    // Background workers.
    let auto_approve = tokio::spawn(blacklist.clone().run_auto_approve_worker(
        root_cancel.clone(),
        AUTO_APPROVE_INTERVAL,
        chrono::Duration::hours(AUTO_APPROVE_EXPIRY_HOURS),
    ));
    let cache_monitor = if rate_limiter.has_cache() {
        Some(tokio::spawn(run_cache_monitor(
            rate_limiter.clone(),
            error_notifier.clone(),
            root_cancel.clone(),
        )))
    } else {
        None
    };

    let manager_service = Arc::new(ManagerService::new(
        store,
        stats,
        vault,
        factory,
        supervisor.clone(),
        retry,
        cfg.superusers.clone(),
    ));

    tokio::spawn(shutdown_signal(root_cancel.clone()));

    run_manager_loop(
        manager_service,
        manager_transport,
        manager_conn.updates,
        root_cancel.clone(),
        error_notifier,
    )
    .await;

    // Shutdown: the root token is cancelled; unwind everything.
    supervisor.stop_all().await;
    let _ = auto_approve.await;
    if let Some(handle) = cache_monitor {
        let _ = handle.await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn run_manager_loop(
    service: Arc<ManagerService>,
    transport: Arc<dyn BotTransport>,
    mut updates: Box<dyn UpdateSource>,
    cancel: CancellationToken,
    error_notifier: Arc<ErrorNotifier>,
) {
    while let Some(update) = updates.next(&cancel).await {
        let handled = std::panic::AssertUnwindSafe(service.handle_update(&cancel, &transport, update))
            .catch_unwind()
            .await;

        if let Err(panic) = handled {
            let description = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %description, "manager update handler panicked");
            error_notifier
                .notify(ErrorKind::SystemPanic, &description, "manager bot update handler")
                .await;
        }
    }
}

async fn run_cache_monitor(
    rate_limiter: Arc<RateLimiter>,
    error_notifier: Arc<ErrorNotifier>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(CACHE_MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = rate_limiter.cache_ping().await {
                    tracing::warn!(error = %e, "redis liveness check failed, rate limiting falls back to memory");
                    error_notifier
                        .notify(ErrorKind::ExternalCache, &e.to_string(), "redis liveness check")
                        .await;
                }
            }
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                cancel.cancel();
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("shutdown signal received");
    cancel.cancel();
}
