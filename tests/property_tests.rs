//! Property-based tests
//!
//! Verify the ledger's invariants across a wide range of inputs.

use proptest::prelude::*;
use std::sync::Arc;
use subscription_ledger::{policy, Amount, ManualClock, MemoryStore, PlanCatalog, TokenLedger};

fn plan_id() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["free", "basic", "pro"])
}

proptest! {
    /// can_transition(p, q) holds iff q is paid and either p is free or
    /// q outranks p. Downgrades and self-transitions are always false.
    #[test]
    fn upgrade_monotonicity(current in plan_id(), target in plan_id()) {
        let catalog = PlanCatalog::standard();
        let expected = target != "free"
            && (current == "free"
                || catalog.rank(target).unwrap() > catalog.rank(current).unwrap());

        let allowed = policy::can_transition(&catalog, Some(current), target).unwrap();
        prop_assert_eq!(allowed, expected);
    }

    /// Absent plans behave like free as the transition source.
    #[test]
    fn absent_plan_acts_like_free(target in plan_id()) {
        let catalog = PlanCatalog::standard();
        let from_none = policy::can_transition(&catalog, None, target).unwrap();
        let from_free = policy::can_transition(&catalog, Some("free"), target).unwrap();
        prop_assert_eq!(from_none, from_free);
    }

    /// Any sequence of spends leaves the balance equal to the initial
    /// allotment minus exactly the admitted costs, and never negative.
    #[test]
    fn spends_never_overdraw(costs in prop::collection::vec(0u64..50, 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ledger = TokenLedger::new(
                store,
                Arc::new(PlanCatalog::standard()),
                Arc::new(ManualClock::new(1_700_000_000)),
            );

            let mut admitted_total = 0u64;
            let mut last = None;
            for cost in &costs {
                match ledger.spend("alice", *cost, "summarizer").await {
                    Ok(sub) => {
                        admitted_total += cost;
                        last = Some(sub);
                    }
                    Err(_) => {}
                }
            }

            prop_assert!(admitted_total <= 100);
            if let Some(sub) = last {
                prop_assert_eq!(sub.tokens_remaining, 100 - admitted_total);
                prop_assert_eq!(sub.tokens_used, admitted_total);
            }
            Ok(())
        })?;
    }

    /// A spend is rejected exactly when it does not fit the balance.
    #[test]
    fn rejection_is_exact(first in 0u64..=100, second in 0u64..=100) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ledger = TokenLedger::new(
                store,
                Arc::new(PlanCatalog::standard()),
                Arc::new(ManualClock::new(1_700_000_000)),
            );

            ledger.spend("alice", first, "summarizer").await.unwrap();
            let result = ledger.spend("alice", second, "summarizer").await;
            prop_assert_eq!(result.is_ok(), first + second <= 100);
            Ok(())
        })?;
    }

    /// Amount addition is commutative and subtraction inverts it.
    #[test]
    fn amount_arithmetic(a in 0i64..1_000_000, b in 0i64..1_000_000) {
        let amount_a = Amount::from_minor(a);
        let amount_b = Amount::from_minor(b);

        let ab = amount_a.checked_add(&amount_b).unwrap();
        let ba = amount_b.checked_add(&amount_a).unwrap();
        prop_assert_eq!(ab, ba);

        let back = ab.checked_sub(&amount_b).unwrap();
        prop_assert_eq!(back, amount_a);
    }

    /// Amounts survive a JSON round trip.
    #[test]
    fn amount_json_round_trip(minor in 0i64..10_000_000) {
        let amount = Amount::from_minor(minor);
        let json = serde_json::to_string(&amount).unwrap();
        let parsed: Amount = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(amount, parsed);
    }
}
