//! Per-user subscription record
//!
//! One active record per user. Created on first user activity with the
//! free plan, mutated only by the token ledger (spend), the payment
//! reconciler (plan change) and the expiration scheduler (renew or
//! downgrade). Never deleted, only superseded through grants.

use crate::{plan::Plan, LedgerError, Result, FREE_PLAN};
use serde::{Deserialize, Deserializer, Serialize};

/// Length of a billing period in seconds (30 days).
pub const PERIOD_SECONDS: i64 = 30 * 86400;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    /// Flagged as lapsed in the stored record (legacy imports, admin
    /// tooling). The next scheduler tick transitions such a record even
    /// if its period window has not ended.
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub period_start: i64,
    pub period_end: i64,
    /// Tokens still spendable in the current period. Legacy records that
    /// drifted negative are clamped to zero on load.
    #[serde(deserialize_with = "clamped_u64")]
    pub tokens_remaining: u64,
    #[serde(deserialize_with = "clamped_u64")]
    pub tokens_used: u64,
    pub auto_renew: bool,
    pub last_confirmed_payment_id: Option<String>,
    /// Plan the user held before an expiry downgrade, if any.
    #[serde(default)]
    pub downgraded_from: Option<String>,
}

/// One-time migration affordance: the legacy system occasionally let
/// balances drift below zero. Out-of-range values deserialize as zero.
fn clamped_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(raw.max(0) as u64)
}

impl Subscription {
    /// First-use provisioning: a fresh free-plan record starting now.
    pub fn new_free(user_id: impl Into<String>, free_plan: &Plan, now: i64) -> Self {
        Self {
            user_id: user_id.into(),
            plan_id: FREE_PLAN.to_string(),
            status: SubscriptionStatus::Active,
            period_start: now,
            period_end: now + PERIOD_SECONDS,
            tokens_remaining: free_plan.token_allotment,
            tokens_used: 0,
            auto_renew: true,
            last_confirmed_payment_id: None,
            downgraded_from: None,
        }
    }

    /// The record after a grant of `plan`: full allotment, zero usage,
    /// a fresh 30-day window. Used by upgrade and renewal flows alike.
    pub fn with_grant(&self, plan: &Plan, now: i64) -> Self {
        Self {
            user_id: self.user_id.clone(),
            plan_id: plan.id.clone(),
            status: SubscriptionStatus::Active,
            period_start: now,
            period_end: now + PERIOD_SECONDS,
            tokens_remaining: plan.token_allotment,
            tokens_used: 0,
            auto_renew: self.auto_renew,
            last_confirmed_payment_id: self.last_confirmed_payment_id.clone(),
            downgraded_from: None,
        }
    }

    /// True iff the current period has ended.
    pub fn is_period_expired(&self, now: i64) -> bool {
        now > self.period_end
    }

    /// True iff a full period has elapsed since the window began, even
    /// when `period_end` has not passed (early monthly refresh).
    pub fn needs_monthly_refresh(&self, now: i64) -> bool {
        now - self.period_start >= PERIOD_SECONDS
    }

    /// Pure availability check: can `cost` tokens be spent right now?
    pub fn has_available(&self, cost: u64) -> bool {
        self.tokens_remaining >= cost
    }

    /// Validate structural invariants of the record.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(
                LedgerError::Configuration("user id cannot be empty".to_string()).into(),
            );
        }
        if self.plan_id.is_empty() {
            return Err(
                LedgerError::Configuration("plan id cannot be empty".to_string()).into(),
            );
        }
        if self.period_end <= self.period_start {
            return Err(LedgerError::Configuration(
                "period end must be after period start".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
