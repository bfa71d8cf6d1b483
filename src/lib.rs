//! # Subscription & Token Ledger Engine
//!
//! Meters usage of a multi-tenant AI service against prepaid token
//! balances tied to subscription plans. Key properties:
//! - Atomic token debits: no sequence of concurrent spends can drive a
//!   balance negative (optimistic versioning at the store level)
//! - Exactly-once payment reconciliation keyed by the external payment id
//! - Upgrade-only plan transitions ordered by plan rank
//! - Idempotent expiration/renewal ticks with an injectable clock
//!
//! The [`SubscriptionService`] facade is the only supported entry point;
//! it is a per-session value constructed with explicit store, clock and
//! payment-initiation dependencies.

pub mod amount;
pub mod clock;
pub mod ledger;
pub mod payment;
pub mod plan;
pub mod policy;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod subscription;
pub mod usage;

pub use amount::Amount;
pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::TokenLedger;
pub use payment::{PaymentReconciler, PaymentRecord, PaymentStatus};
pub use plan::{Plan, PlanCatalog, FREE_PLAN};
pub use scheduler::{ExpirationScheduler, TickOutcome};
pub use service::{PaymentInitiator, RedirectTarget, ServiceCosts, SubscriptionService};
pub use storage::{FileStore, LedgerStore, MemoryStore, PaymentCommit, VersionedSubscription};
pub use subscription::{Subscription, SubscriptionStatus, PERIOD_SECONDS};
pub use usage::UsageLogEntry;

pub type Result<T> = anyhow::Result<T>;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("insufficient tokens: {required} required, {remaining} remaining")]
    InsufficientTokens { remaining: u64, required: u64 },
    #[error("cannot change plan from '{from}' to '{to}'")]
    IllegalPlanTransition { from: String, to: String },
    #[error("payment '{payment_id}' confirmed but plan '{from}' cannot transition to '{to}'")]
    ReconciliationConflict {
        payment_id: String,
        from: String,
        to: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Store(String),
}
