//! Blacklist engine.
//!
//! "Is this guest blocked" is a pure function of the latest non-deleted
//! entry for the (bot, guest) pair; there is no separate mutable flag.
//! A pending ban takes effect immediately (no bypass window during human
//! review) and a pending unban keeps the prior ban in force until decided.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fwdbot_store::models::{BlacklistEntry, RequestKind, RequestStatus};
use fwdbot_store::Store;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{errors::Error, Result};

pub struct BlacklistEngine {
    store: Store,
}

impl BlacklistEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn is_blacklisted(&self, bot_id: Uuid, guest_user_id: i64) -> Result<bool> {
        let guest = match self.store.guest_by_bot_and_user(bot_id, guest_user_id) {
            Ok(guest) => guest,
            Err(fwdbot_store::StoreError::NotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let Some(latest) = self.store.latest_blacklist_for_guest(bot_id, guest.id)? else {
            return Ok(false);
        };

        Ok(effective(&latest))
    }

    /// Opens a ban request. Accepted only when the latest state admits it:
    /// no prior entry, ban pending/rejected, or unban approved.
    pub fn create_ban_request(
        &self,
        bot_id: Uuid,
        guest_user_id: i64,
        request_user_id: Uuid,
    ) -> Result<BlacklistEntry> {
        let guest = self.store.get_or_create_guest(bot_id, guest_user_id)?;

        if let Some(latest) = self.store.latest_blacklist_for_guest(bot_id, guest.id)? {
            let admits = match latest.request_kind {
                RequestKind::Ban => matches!(
                    latest.status,
                    RequestStatus::Pending | RequestStatus::Rejected
                ),
                RequestKind::Unban => latest.status == RequestStatus::Approved,
            };
            if !admits {
                return Err(refused("ban", &latest));
            }
        }

        Ok(self
            .store
            .insert_blacklist(bot_id, guest.id, RequestKind::Ban, request_user_id)?)
    }

    /// Opens an unban request. Accepted only when the latest state is
    /// ban approved or unban pending/rejected.
    pub fn create_unban_request(
        &self,
        bot_id: Uuid,
        guest_user_id: i64,
        request_user_id: Uuid,
    ) -> Result<BlacklistEntry> {
        let guest = self.store.get_or_create_guest(bot_id, guest_user_id)?;

        if let Some(latest) = self.store.latest_blacklist_for_guest(bot_id, guest.id)? {
            let admits = match latest.request_kind {
                RequestKind::Unban => matches!(
                    latest.status,
                    RequestStatus::Pending | RequestStatus::Rejected
                ),
                RequestKind::Ban => latest.status == RequestStatus::Approved,
            };
            if !admits {
                return Err(refused("unban", &latest));
            }
        } else {
            return Err(Error::Validation(
                "cannot request unban: no prior blacklist entry".to_string(),
            ));
        }

        Ok(self
            .store
            .insert_blacklist(bot_id, guest.id, RequestKind::Unban, request_user_id)?)
    }

    /// Approves every entry still pending after `expiry` of wall time.
    /// Models silent consent for unattended fleets.
    pub fn auto_approve_expired(&self, expiry: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - expiry;
        Ok(self.store.auto_approve_expired(cutoff)?)
    }

    /// Periodic worker driving [`auto_approve_expired`]. The interval and
    /// expiry are injected so tests can compress time.
    pub async fn run_auto_approve_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
        interval: Duration,
        expiry: chrono::Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; skip that first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.auto_approve_expired(expiry) {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(count = n, "auto-approved expired blacklist requests"),
                        Err(e) => tracing::error!(error = %e, "failed to auto-approve expired blacklist requests"),
                    }
                }
            }
        }
    }
}

/// Whether the latest entry currently blocks the guest.
fn effective(latest: &BlacklistEntry) -> bool {
    match (latest.request_kind, latest.status) {
        (RequestKind::Ban, RequestStatus::Approved) => true,
        (RequestKind::Ban, RequestStatus::Pending) => true,
        (RequestKind::Ban, RequestStatus::Rejected) => false,
        (RequestKind::Unban, RequestStatus::Approved) => false,
        // Still effective until decided.
        (RequestKind::Unban, RequestStatus::Pending) => true,
        (RequestKind::Unban, RequestStatus::Rejected) => true,
    }
}

fn refused(requested: &str, latest: &BlacklistEntry) -> Error {
    Error::Validation(format!(
        "cannot request {requested}: latest state is {} {}, which does not allow it",
        latest.request_kind.as_str(),
        latest.status.as_str(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwdbot_store::models::AuditAction;
    use fwdbot_store::models::AuditEntry;

    struct Fixture {
        engine: BlacklistEngine,
        store: Store,
        bot: Uuid,
        requester: Uuid,
    }

    const GUEST: i64 = 500;

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let mgr = store.get_or_create_user(1, None).unwrap().id;
        let bot = store.register_bot("c", "b", mgr, 1).unwrap().id;
        Fixture {
            engine: BlacklistEngine::new(store.clone()),
            store,
            bot,
            requester: mgr,
        }
    }

    fn decide(f: &Fixture, entry: &BlacklistEntry, status: RequestStatus) {
        let audit = AuditEntry {
            id: Uuid::new_v4(),
            user_id: None,
            action: AuditAction::Ban,
            resource_type: "blacklist".to_string(),
            resource_id: entry.id,
            details: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert!(f.store.decide_blacklist(entry.id, status, &audit).unwrap());
    }

    #[test]
    fn unknown_guest_is_not_blacklisted() {
        let f = fixture();
        assert!(!f.engine.is_blacklisted(f.bot, GUEST).unwrap());
    }

    #[test]
    fn truth_table() {
        let f = fixture();

        // ban pending → blocked (takes effect during review).
        let ban = f.engine.create_ban_request(f.bot, GUEST, f.requester).unwrap();
        assert!(f.engine.is_blacklisted(f.bot, GUEST).unwrap());

        // ban approved → blocked.
        decide(&f, &ban, RequestStatus::Approved);
        assert!(f.engine.is_blacklisted(f.bot, GUEST).unwrap());

        // unban pending → still blocked until decided.
        let unban = f
            .engine
            .create_unban_request(f.bot, GUEST, f.requester)
            .unwrap();
        assert!(f.engine.is_blacklisted(f.bot, GUEST).unwrap());

        // unban rejected → still blocked.
        decide(&f, &unban, RequestStatus::Rejected);
        assert!(f.engine.is_blacklisted(f.bot, GUEST).unwrap());

        // second unban, approved → unblocked.
        let unban2 = f
            .engine
            .create_unban_request(f.bot, GUEST, f.requester)
            .unwrap();
        decide(&f, &unban2, RequestStatus::Approved);
        assert!(!f.engine.is_blacklisted(f.bot, GUEST).unwrap());

        // ban rejected → unblocked.
        let ban2 = f.engine.create_ban_request(f.bot, GUEST, f.requester).unwrap();
        decide(&f, &ban2, RequestStatus::Rejected);
        assert!(!f.engine.is_blacklisted(f.bot, GUEST).unwrap());
    }

    #[test]
    fn ban_gate() {
        let f = fixture();

        // No prior entry admits a ban.
        let ban = f.engine.create_ban_request(f.bot, GUEST, f.requester).unwrap();

        // ban pending admits another ban request.
        f.engine.create_ban_request(f.bot, GUEST, f.requester).unwrap();

        // ban approved does not.
        decide(&f, &ban, RequestStatus::Approved);
        // (the second pending request is now latest; decide it too so the
        // approved ban is the latest state)
        let latest = f
            .store
            .latest_blacklist_for_guest(f.bot, f.store.guest_by_bot_and_user(f.bot, GUEST).unwrap().id)
            .unwrap()
            .unwrap();
        decide(&f, &latest, RequestStatus::Approved);

        let refused = f.engine.create_ban_request(f.bot, GUEST, f.requester);
        assert!(matches!(refused, Err(Error::Validation(_))));
    }

    #[test]
    fn unban_gate() {
        let f = fixture();

        // No prior entry: unban refused.
        assert!(matches!(
            f.engine.create_unban_request(f.bot, GUEST, f.requester),
            Err(Error::Validation(_))
        ));

        // ban pending: unban refused (ban not yet in force formally).
        let ban = f.engine.create_ban_request(f.bot, GUEST, f.requester).unwrap();
        assert!(matches!(
            f.engine.create_unban_request(f.bot, GUEST, f.requester),
            Err(Error::Validation(_))
        ));

        // ban approved: unban admitted.
        decide(&f, &ban, RequestStatus::Approved);
        let unban = f
            .engine
            .create_unban_request(f.bot, GUEST, f.requester)
            .unwrap();

        // unban approved: further unban refused.
        decide(&f, &unban, RequestStatus::Approved);
        assert!(matches!(
            f.engine.create_unban_request(f.bot, GUEST, f.requester),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn auto_approve_flips_pending_unban() {
        let f = fixture();

        let ban = f.engine.create_ban_request(f.bot, GUEST, f.requester).unwrap();
        decide(&f, &ban, RequestStatus::Approved);
        f.engine
            .create_unban_request(f.bot, GUEST, f.requester)
            .unwrap();
        assert!(f.engine.is_blacklisted(f.bot, GUEST).unwrap());

        // Nothing is older than 24h yet.
        assert_eq!(
            f.engine.auto_approve_expired(chrono::Duration::hours(24)).unwrap(),
            0
        );

        // With a zero expiry every pending row qualifies; the worker's
        // sweep flips the unban and the guest is unblocked.
        assert_eq!(
            f.engine.auto_approve_expired(chrono::Duration::zero()).unwrap(),
            1
        );
        assert!(!f.engine.is_blacklisted(f.bot, GUEST).unwrap());
    }
}
