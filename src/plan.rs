//! Plan catalog
//!
//! Static lookup table defining each plan's token allotment, price and
//! upgrade rank. Every plan id entering the engine is validated against
//! this catalog; an unknown id is a deployment bug and fails fast with
//! `LedgerError::Configuration` instead of silently defaulting to free.

use crate::{Amount, LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Id of the zero-cost baseline plan. Rank 0; expired paid plans fall
/// back to it.
pub const FREE_PLAN: &str = "free";

/// A named tier with a fixed monthly token allotment and price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: String,
    pub display_name: String,
    /// Monthly price in minor currency units.
    pub price: Amount,
    /// Tokens granted at the start of each period.
    pub token_allotment: u64,
    /// Total order used by the upgrade policy; `free` is rank 0.
    pub rank: u32,
}

/// Immutable catalog of all known plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
}

impl PlanCatalog {
    /// Build a catalog from plan definitions.
    ///
    /// The catalog must contain a `free` plan with rank 0 and zero
    /// price, and ranks must be unique so the upgrade order is total.
    pub fn new(plans: Vec<Plan>) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut ranks = HashMap::new();
        for plan in plans {
            if let Some(other) = ranks.insert(plan.rank, plan.id.clone()) {
                return Err(LedgerError::Configuration(format!(
                    "plans '{}' and '{}' share rank {}",
                    other, plan.id, plan.rank
                ))
                .into());
            }
            if by_id.insert(plan.id.clone(), plan).is_some() {
                return Err(
                    LedgerError::Configuration("duplicate plan id in catalog".to_string()).into(),
                );
            }
        }

        let catalog = Self { plans: by_id };
        let free = catalog.get(FREE_PLAN)?;
        if free.rank != 0 || !free.price.is_zero() {
            return Err(LedgerError::Configuration(
                "free plan must have rank 0 and zero price".to_string(),
            )
            .into());
        }
        Ok(catalog)
    }

    /// Load catalog definitions from a JSON array of plans.
    pub fn from_json(json: &str) -> Result<Self> {
        let plans: Vec<Plan> = serde_json::from_str(json)?;
        Self::new(plans)
    }

    /// The built-in three-tier catalog.
    pub fn standard() -> Self {
        Self::new(vec![
            Plan {
                id: FREE_PLAN.to_string(),
                display_name: "Free".to_string(),
                price: Amount::zero(),
                token_allotment: 100,
                rank: 0,
            },
            Plan {
                id: "basic".to_string(),
                display_name: "Basic".to_string(),
                price: Amount::from_minor(999),
                token_allotment: 1000,
                rank: 1,
            },
            Plan {
                id: "pro".to_string(),
                display_name: "Pro".to_string(),
                price: Amount::from_minor(2999),
                token_allotment: 5000,
                rank: 2,
            },
        ])
        .expect("built-in catalog is valid")
    }

    /// Look up a plan. Unknown ids are a configuration error.
    pub fn get(&self, plan_id: &str) -> Result<&Plan> {
        self.plans.get(plan_id).ok_or_else(|| {
            LedgerError::Configuration(format!("unknown plan id '{}'", plan_id)).into()
        })
    }

    /// Tokens granted per period for a plan.
    pub fn allotment(&self, plan_id: &str) -> Result<u64> {
        Ok(self.get(plan_id)?.token_allotment)
    }

    /// Upgrade rank of a plan.
    pub fn rank(&self, plan_id: &str) -> Result<u32> {
        Ok(self.get(plan_id)?.rank)
    }

    /// Monthly price of a plan in minor units.
    pub fn price(&self, plan_id: &str) -> Result<Amount> {
        Ok(self.get(plan_id)?.price)
    }

    pub fn is_free(plan_id: &str) -> bool {
        plan_id == FREE_PLAN
    }
}
