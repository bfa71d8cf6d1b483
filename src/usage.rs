//! Append-only usage audit trail
//!
//! One entry per admitted spend. The trail is for reporting only; the
//! subscription balance is the source of truth, never a sum over the log.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageLogEntry {
    pub entry_id: String,
    pub user_id: String,
    pub service: String,
    pub tokens_cost: u64,
    pub occurred_at: i64,
    /// Plan the user was on when the spend happened.
    pub plan_id_at_time: String,
}

impl UsageLogEntry {
    pub fn new(
        user_id: impl Into<String>,
        service: impl Into<String>,
        tokens_cost: u64,
        occurred_at: i64,
        plan_id_at_time: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            service: service.into(),
            tokens_cost,
            occurred_at,
            plan_id_at_time: plan_id_at_time.into(),
        }
    }
}

/// Total tokens spent per service, for reporting.
pub fn tokens_by_service(entries: &[UsageLogEntry]) -> HashMap<String, u64> {
    let mut totals: HashMap<String, u64> = HashMap::new();
    for entry in entries {
        *totals.entry(entry.service.clone()).or_insert(0) += entry.tokens_cost;
    }
    totals
}
