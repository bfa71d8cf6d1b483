//! Upgrade policy
//!
//! Pure decision over plan ranks: transitions only go up. Evaluated
//! before any payment is initiated and re-checked at confirmation time,
//! since the subscription may have changed in between.

use crate::{LedgerError, PlanCatalog, Result};

/// Whether moving from `current` to `target` is a legal upgrade.
///
/// - No current plan, or current is `free`: any non-free target is allowed.
/// - Otherwise the target's rank must be strictly greater.
/// - Same-plan "upgrades" and downgrades are never allowed.
pub fn can_transition(
    catalog: &PlanCatalog,
    current: Option<&str>,
    target: &str,
) -> Result<bool> {
    let target_rank = catalog.rank(target)?;
    if PlanCatalog::is_free(target) {
        return Ok(false);
    }
    match current {
        None => Ok(true),
        Some(current) if PlanCatalog::is_free(current) => Ok(true),
        Some(current) => Ok(target_rank > catalog.rank(current)?),
    }
}

/// Like [`can_transition`] but rejects with `IllegalPlanTransition`
/// carrying both plan names for the user-facing message.
pub fn check_transition(catalog: &PlanCatalog, current: Option<&str>, target: &str) -> Result<()> {
    if can_transition(catalog, current, target)? {
        Ok(())
    } else {
        Err(LedgerError::IllegalPlanTransition {
            from: current.unwrap_or("none").to_string(),
            to: target.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_can_upgrade_to_any_paid_plan() {
        let catalog = PlanCatalog::standard();
        assert!(can_transition(&catalog, Some("free"), "basic").unwrap());
        assert!(can_transition(&catalog, Some("free"), "pro").unwrap());
        assert!(can_transition(&catalog, None, "pro").unwrap());
    }

    #[test]
    fn test_upgrades_follow_rank_order() {
        let catalog = PlanCatalog::standard();
        assert!(can_transition(&catalog, Some("basic"), "pro").unwrap());
        assert!(!can_transition(&catalog, Some("pro"), "basic").unwrap());
    }

    #[test]
    fn test_self_transition_rejected() {
        let catalog = PlanCatalog::standard();
        assert!(!can_transition(&catalog, Some("basic"), "basic").unwrap());
        assert!(!can_transition(&catalog, Some("free"), "free").unwrap());
    }

    #[test]
    fn test_free_is_never_a_target() {
        let catalog = PlanCatalog::standard();
        assert!(!can_transition(&catalog, Some("pro"), "free").unwrap());
        assert!(!can_transition(&catalog, None, "free").unwrap());
    }

    #[test]
    fn test_unknown_plan_is_configuration_error() {
        let catalog = PlanCatalog::standard();
        assert!(can_transition(&catalog, Some("free"), "enterprise").is_err());
        assert!(can_transition(&catalog, Some("enterprise"), "pro").is_err());
    }

    #[test]
    fn test_check_transition_names_both_plans() {
        let catalog = PlanCatalog::standard();
        let err = check_transition(&catalog, Some("pro"), "basic").unwrap_err();
        match err.downcast_ref::<LedgerError>() {
            Some(LedgerError::IllegalPlanTransition { from, to }) => {
                assert_eq!(from, "pro");
                assert_eq!(to, "basic");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
