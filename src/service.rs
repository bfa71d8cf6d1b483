//! Subscription service facade
//!
//! The only supported entry point for callers: metered API handlers,
//! payment webhook handlers and the scheduler tick all go through this
//! type. One value per logical session, constructed with explicit store,
//! clock, catalog and payment-initiation dependencies; there is no
//! process-wide singleton.

use crate::{
    policy, scheduler, storage::load_or_provision, Clock, LedgerError, LedgerStore,
    PaymentReconciler, PaymentRecord, Plan, PlanCatalog, Result, Subscription, SystemClock,
    TickOutcome, TokenLedger, UsageLogEntry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Opaque redirect target returned by the external checkout collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedirectTarget(pub String);

/// External payment initiation. How the checkout is hosted is out of
/// scope; the engine only hands the user off and later reconciles the
/// confirmation.
#[async_trait]
pub trait PaymentInitiator: Send + Sync {
    async fn begin_checkout(&self, user_id: &str, plan: &Plan) -> Result<RedirectTarget>;
}

/// Token cost per unit of each metered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCosts {
    costs: HashMap<String, u64>,
}

impl ServiceCosts {
    pub fn new(costs: HashMap<String, u64>) -> Self {
        Self { costs }
    }

    /// The built-in cost table.
    pub fn standard() -> Self {
        let mut costs = HashMap::new();
        costs.insert("metaphor-classifier".to_string(), 1);
        costs.insert("chat-completion".to_string(), 2);
        costs.insert("summarizer".to_string(), 5);
        Self { costs }
    }

    /// Token cost for one unit of `service`. Unknown services are a
    /// configuration error, never a free pass.
    pub fn cost_of(&self, service: &str) -> Result<u64> {
        self.costs.get(service).copied().ok_or_else(|| {
            LedgerError::Configuration(format!("unknown service '{}'", service)).into()
        })
    }
}

pub struct SubscriptionService {
    user_id: String,
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PlanCatalog>,
    costs: Arc<ServiceCosts>,
    clock: Arc<dyn Clock>,
    initiator: Arc<dyn PaymentInitiator>,
    ledger: TokenLedger,
    reconciler: PaymentReconciler,
}

impl SubscriptionService {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PlanCatalog>,
        costs: Arc<ServiceCosts>,
        clock: Arc<dyn Clock>,
        initiator: Arc<dyn PaymentInitiator>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            ledger: TokenLedger::new(store.clone(), catalog.clone(), clock.clone()),
            reconciler: PaymentReconciler::new(store.clone(), catalog.clone(), clock.clone()),
            store,
            catalog,
            costs,
            clock,
            initiator,
        }
    }

    /// Convenience constructor with the built-in catalog, cost table and
    /// the system clock.
    pub fn with_defaults(
        user_id: impl Into<String>,
        store: Arc<dyn LedgerStore>,
        initiator: Arc<dyn PaymentInitiator>,
    ) -> Self {
        Self::new(
            user_id,
            store,
            Arc::new(PlanCatalog::standard()),
            Arc::new(ServiceCosts::standard()),
            Arc::new(SystemClock),
            initiator,
        )
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The session's current subscription, provisioned on first use.
    pub async fn subscription(&self) -> Result<Subscription> {
        let current =
            load_or_provision(&*self.store, &self.catalog, &*self.clock, &self.user_id).await?;
        Ok(current.subscription)
    }

    /// Whether one call to `service` fits the current balance. Advisory
    /// only; `consume_tokens` re-checks atomically at commit time.
    pub async fn check_tokens_available(&self, service: &str) -> Result<bool> {
        let cost = self.costs.cost_of(service)?;
        let sub = self.subscription().await?;
        Ok(TokenLedger::check_available(&sub, cost))
    }

    /// Spend the tokens for one call to `service`.
    pub async fn consume_tokens(&self, service: &str) -> Result<Subscription> {
        self.consume_tokens_for(service, 1).await
    }

    /// Spend the tokens for `units` units of `service` (e.g. lines
    /// classified) in one atomic debit.
    pub async fn consume_tokens_for(&self, service: &str, units: u64) -> Result<Subscription> {
        let cost = self
            .costs
            .cost_of(service)?
            .checked_mul(units)
            .ok_or_else(|| LedgerError::Configuration("token cost overflow".to_string()))?;
        self.ledger.spend(&self.user_id, cost, service).await
    }

    /// Validate the upgrade and hand off to the external checkout.
    /// No state changes here; the grant happens at reconciliation.
    pub async fn request_upgrade(&self, plan_id: &str) -> Result<RedirectTarget> {
        let current = self.subscription().await?;
        policy::check_transition(&self.catalog, Some(&current.plan_id), plan_id)?;
        let plan = self.catalog.get(plan_id)?;
        debug!(user_id = %self.user_id, plan_id, "upgrade requested, handing off to checkout");
        self.initiator.begin_checkout(&self.user_id, plan).await
    }

    /// Apply an asynchronous payment confirmation exactly once.
    pub async fn on_payment_confirmed(
        &self,
        payment_id: &str,
        plan_id: &str,
    ) -> Result<Subscription> {
        self.reconciler
            .confirm_payment(&self.user_id, payment_id, plan_id)
            .await
    }

    /// Run one expiration evaluation for this session's user.
    pub async fn tick(&self) -> Result<TickOutcome> {
        scheduler::tick_user(&*self.store, &self.catalog, &*self.clock, &self.user_id).await
    }

    /// Confirmed payments for this user, oldest first.
    pub async fn payment_history(&self) -> Result<Vec<PaymentRecord>> {
        self.store.list_payments(&self.user_id).await
    }

    /// Usage audit trail for this user. Reporting only; the balance on
    /// the subscription record is the source of truth.
    pub async fn usage_history(&self) -> Result<Vec<UsageLogEntry>> {
        self.store.list_usage(&self.user_id).await
    }
}
