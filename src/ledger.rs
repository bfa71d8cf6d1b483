//! Token ledger
//!
//! Owns a user's balance and applies atomic debits and credits. The
//! binding contract: under concurrent spends for one user the store
//! behaves as if they were applied in some serial order, and no admitted
//! spend may overdraw. The availability check is therefore part of each
//! commit attempt, never a separate earlier read.

use crate::{
    storage::load_or_provision, Clock, LedgerError, LedgerStore, PlanCatalog, Result,
    Subscription, UsageLogEntry,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Attempts per optimistic commit before surfacing contention as a
/// retryable storage error.
pub(crate) const MAX_COMMIT_ATTEMPTS: usize = 128;

pub struct TokenLedger {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
}

impl TokenLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Pure availability check, no side effect.
    pub fn check_available(subscription: &Subscription, cost: u64) -> bool {
        subscription.has_available(cost)
    }

    /// Atomically debit `cost` tokens and append a usage entry.
    ///
    /// The balance check runs against the freshly loaded record inside a
    /// compare-and-swap loop, so a stale read can never authorize a
    /// spend that would drive the balance negative. The debit and its
    /// usage entry are one store commit; on any error nothing was
    /// debited and the spend is safe to retry.
    pub async fn spend(&self, user_id: &str, cost: u64, service: &str) -> Result<Subscription> {
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let current =
                load_or_provision(&*self.store, &self.catalog, &*self.clock, user_id).await?;
            let sub = current.subscription;

            if !sub.has_available(cost) {
                return Err(LedgerError::InsufficientTokens {
                    remaining: sub.tokens_remaining,
                    required: cost,
                }
                .into());
            }

            let mut next = sub.clone();
            next.tokens_remaining -= cost;
            next.tokens_used += cost;

            let entry = UsageLogEntry::new(
                user_id,
                service,
                cost,
                self.clock.now(),
                next.plan_id.clone(),
            );
            if self.store.commit_spend(current.version, &next, &entry).await? {
                debug!(
                    user_id,
                    service,
                    cost,
                    remaining = next.tokens_remaining,
                    "tokens spent"
                );
                return Ok(next);
            }
            // Lost the race; reload and retry
        }
        Err(LedgerError::Store(format!(
            "spend for '{}' kept losing the version race",
            user_id
        ))
        .into())
    }

    /// Reset the subscription to the full allotment of `plan_id` with a
    /// fresh period window. Shared by upgrade and renewal flows.
    pub async fn grant(&self, user_id: &str, plan_id: &str) -> Result<Subscription> {
        let plan = self.catalog.get(plan_id)?;
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let current =
                load_or_provision(&*self.store, &self.catalog, &*self.clock, user_id).await?;
            let next = current.subscription.with_grant(plan, self.clock.now());
            if self.store.update_subscription(current.version, &next).await? {
                info!(user_id, plan_id, allotment = plan.token_allotment, "plan granted");
                return Ok(next);
            }
        }
        Err(LedgerError::Store(format!(
            "grant for '{}' kept losing the version race",
            user_id
        ))
        .into())
    }
}
