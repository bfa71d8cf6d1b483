//! Expiration scheduler
//!
//! Evaluates a subscription against wall-clock time and performs renewal
//! or downgrade transitions:
//! - free plan past its period end (or a full period since the window
//!   began): renew with a fresh free allotment
//! - paid plan past its period end with no renewal payment: fall back to
//!   free with `auto_renew` off and the old plan recorded
//!
//! Ticks are idempotent: a transition advances the period window past
//! its own trigger condition, so running twice in quick succession never
//! double-grants. Ticks are best-effort; a skipped tick only delays a
//! transition, never corrupts state.

use crate::{
    ledger::MAX_COMMIT_ATTEMPTS, storage::load_or_provision, Clock, LedgerError, LedgerStore,
    PlanCatalog, Result, Subscription, SubscriptionService, SubscriptionStatus, FREE_PLAN,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// What a tick did to the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NoChange,
    Renewed,
    Downgraded,
}

enum Transition {
    None,
    RenewFree,
    DowngradeToFree,
}

fn evaluate(sub: &Subscription, now: i64) -> Transition {
    // Records flagged expired in storage transition regardless of the
    // period window.
    let lapsed = sub.status == SubscriptionStatus::Expired;
    if PlanCatalog::is_free(&sub.plan_id) {
        if lapsed || sub.is_period_expired(now) || sub.needs_monthly_refresh(now) {
            Transition::RenewFree
        } else {
            Transition::None
        }
    } else if lapsed || sub.is_period_expired(now) {
        Transition::DowngradeToFree
    } else {
        Transition::None
    }
}

/// Run one expiration evaluation for a single user, applying at most one
/// transition atomically.
pub async fn tick_user(
    store: &dyn LedgerStore,
    catalog: &PlanCatalog,
    clock: &dyn Clock,
    user_id: &str,
) -> Result<TickOutcome> {
    let free = catalog.get(FREE_PLAN)?;
    for _ in 0..MAX_COMMIT_ATTEMPTS {
        let current = load_or_provision(store, catalog, clock, user_id).await?;
        let sub = &current.subscription;
        let now = clock.now();

        let (next, outcome) = match evaluate(sub, now) {
            Transition::None => {
                debug!(user_id, "tick: no transition due");
                return Ok(TickOutcome::NoChange);
            }
            Transition::RenewFree => (sub.with_grant(free, now), TickOutcome::Renewed),
            Transition::DowngradeToFree => {
                let mut next = sub.with_grant(free, now);
                next.auto_renew = false;
                next.downgraded_from = Some(sub.plan_id.clone());
                (next, TickOutcome::Downgraded)
            }
        };

        if store.update_subscription(current.version, &next).await? {
            info!(
                user_id,
                outcome = ?outcome,
                from = %sub.plan_id,
                "expiration transition applied"
            );
            return Ok(outcome);
        }
    }
    Err(LedgerError::Store(format!(
        "tick for '{}' kept losing the version race",
        user_id
    ))
    .into())
}

/// Background loop driving the facade's `tick` on a fixed interval.
///
/// Shutdown is signalled through a watch channel; a full per-user
/// transition is a single atomic commit, so cancellation between ticks
/// never leaves a tick half-applied.
pub struct ExpirationScheduler {
    service: Arc<SubscriptionService>,
    check_interval: Duration,
}

impl ExpirationScheduler {
    pub fn new(service: Arc<SubscriptionService>, check_interval: Duration) -> Self {
        Self {
            service,
            check_interval,
        }
    }

    /// Create with the default check interval (1 hour).
    pub fn with_default_interval(service: Arc<SubscriptionService>) -> Self {
        Self::new(service, Duration::from_secs(3600))
    }

    /// Run until `true` is observed on the shutdown channel (or all
    /// senders drop). Tick failures are logged and retried next round.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.service.tick().await {
                warn!(error = %e, "expiration tick failed");
            }

            tokio::select! {
                _ = sleep(self.check_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
