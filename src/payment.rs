//! Payment reconciliation
//!
//! Applies an external payment confirmation to a subscription exactly
//! once, keyed by the payment/session id. Confirmations may arrive more
//! than once (success-page reloads, webhook retries) or out of order
//! relative to the upgrade request; the reconciler is robust to both.
//!
//! A confirmation that is no longer legal still persists its record,
//! since the money was real and must stay in the audit trail. It then
//! surfaces a `ReconciliationConflict` for the alerting path instead of
//! silently granting or dropping the payment.

use crate::{
    policy,
    storage::{load_or_provision, PaymentCommit},
    Amount, Clock, LedgerError, LedgerStore, PlanCatalog, Result, Subscription,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentStatus {
    Completed,
}

/// Append-only record of a confirmed payment. At most one record per
/// `(user_id, payment_id)` pair is ever persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    /// External idempotency key (payment/session id).
    pub payment_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub confirmed_at: i64,
}

pub struct PaymentReconciler {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
}

impl PaymentReconciler {
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

    /// Apply a payment confirmation.
    ///
    /// Duplicate deliveries return the current subscription unchanged.
    /// The upgrade policy is re-validated against the subscription as of
    /// now, not as of initiation; the duplicate check and the grant are
    /// one atomic store write.
    pub async fn confirm_payment(
        &self,
        user_id: &str,
        payment_id: &str,
        plan_id: &str,
    ) -> Result<Subscription> {
        // Unknown plan ids abort before anything is persisted.
        let plan = self.catalog.get(plan_id)?;

        for _ in 0..crate::ledger::MAX_COMMIT_ATTEMPTS {
            if self.store.get_payment(user_id, payment_id).await?.is_some() {
                return self.current_subscription(user_id).await;
            }

            let current =
                load_or_provision(&*self.store, &self.catalog, &*self.clock, user_id).await?;
            let now = self.clock.now();
            let record = PaymentRecord {
                payment_id: payment_id.to_string(),
                user_id: user_id.to_string(),
                plan_id: plan_id.to_string(),
                amount: plan.price,
                status: PaymentStatus::Completed,
                confirmed_at: now,
            };

            let legal = policy::can_transition(
                &self.catalog,
                Some(&current.subscription.plan_id),
                plan_id,
            )?;

            if legal {
                let mut next = current.subscription.with_grant(plan, now);
                next.auto_renew = true;
                next.last_confirmed_payment_id = Some(payment_id.to_string());

                match self
                    .store
                    .commit_payment(&record, Some((current.version, next.clone())))
                    .await?
                {
                    PaymentCommit::Applied => {
                        info!(user_id, payment_id, plan_id, "payment reconciled, plan granted");
                        return Ok(next);
                    }
                    PaymentCommit::Duplicate => {
                        return self.current_subscription(user_id).await;
                    }
                    PaymentCommit::VersionConflict => continue,
                }
            } else {
                // Persist the record anyway; funds never vanish from the
                // audit trail. The grant is withheld.
                match self.store.commit_payment(&record, None).await? {
                    PaymentCommit::Applied => {
                        warn!(
                            user_id,
                            payment_id,
                            from = %current.subscription.plan_id,
                            to = plan_id,
                            "payment confirmed but transition is no longer legal"
                        );
                        return Err(LedgerError::ReconciliationConflict {
                            payment_id: payment_id.to_string(),
                            from: current.subscription.plan_id.clone(),
                            to: plan_id.to_string(),
                        }
                        .into());
                    }
                    PaymentCommit::Duplicate => {
                        return self.current_subscription(user_id).await;
                    }
                    PaymentCommit::VersionConflict => continue,
                }
            }
        }
        Err(LedgerError::Store(format!(
            "payment '{}' kept losing the version race",
            payment_id
        ))
        .into())
    }

    async fn current_subscription(&self, user_id: &str) -> Result<Subscription> {
        let current =
            load_or_provision(&*self.store, &self.catalog, &*self.clock, user_id).await?;
        Ok(current.subscription)
    }
}
