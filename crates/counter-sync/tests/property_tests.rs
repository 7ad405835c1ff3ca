//! Property-based tests for counter-sync
//!
//! Uses proptest to verify feed and guard invariants across randomized inputs

use counter_sync::testing::address;
use counter_sync::{
    merge_logs, scan_window, ActionKind, CounterValue, Decision, LedgerLog, NetworkGuard, TxHash,
    WarningPolicy,
};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Logs of one kind in ledger order (non-decreasing block)
fn scan_strategy(kind: ActionKind, tag: u8) -> impl Strategy<Value = Vec<LedgerLog>> {
    prop::collection::vec(0u64..50, 0..25).prop_map(move |mut blocks| {
        blocks.sort_unstable();
        blocks
            .into_iter()
            .enumerate()
            .map(|(i, block_number)| {
                let mut hash = [tag; 32];
                hash[31] = i as u8;
                LedgerLog {
                    kind,
                    block_number,
                    transaction_id: TxHash::new(hash),
                    new_count: CounterValue::from(i as u64),
                }
            })
            .collect()
    })
}

fn chain_id_strategy() -> impl Strategy<Value = Option<u64>> {
    prop::option::of(prop_oneof![Just(31_337u64), Just(84_532u64), 1u64..100])
}

// ============================================================================
// Activity Feed Properties
// ============================================================================

proptest! {
    /// Property: the feed never exceeds the cap
    #[test]
    fn prop_feed_capped(
        increments in scan_strategy(ActionKind::Increment, 1),
        decrements in scan_strategy(ActionKind::Decrement, 2),
        cap in 0usize..15,
    ) {
        let total = increments.len() + decrements.len();
        let merged = merge_logs(increments, decrements, cap);
        prop_assert_eq!(merged.len(), total.min(cap));
    }

    /// Property: blocks are non-increasing
    #[test]
    fn prop_feed_newest_first(
        increments in scan_strategy(ActionKind::Increment, 1),
        decrements in scan_strategy(ActionKind::Decrement, 2),
    ) {
        let merged = merge_logs(increments, decrements, 10);
        for pair in merged.windows(2) {
            prop_assert!(pair[0].block_number >= pair[1].block_number);
        }
    }

    /// Property: the feed holds the newest logs, not an arbitrary subset
    #[test]
    fn prop_feed_keeps_newest(
        increments in scan_strategy(ActionKind::Increment, 1),
        decrements in scan_strategy(ActionKind::Decrement, 2),
    ) {
        let mut blocks: Vec<u64> = increments
            .iter()
            .chain(decrements.iter())
            .map(|l| l.block_number)
            .collect();
        blocks.sort_unstable_by(|a, b| b.cmp(a));
        blocks.truncate(10);

        let merged = merge_logs(increments, decrements, 10);
        let merged_blocks: Vec<u64> = merged.iter().map(|l| l.block_number).collect();
        prop_assert_eq!(merged_blocks, blocks);
    }

    /// Property: logs sharing a block keep scan order, increments first
    #[test]
    fn prop_ties_keep_scan_order(
        increments in scan_strategy(ActionKind::Increment, 1),
        decrements in scan_strategy(ActionKind::Decrement, 2),
    ) {
        let position = |log: &LedgerLog| {
            let offset = match log.kind {
                ActionKind::Increment => 0,
                ActionKind::Decrement => 1_000,
            };
            offset + log.transaction_id.0[31] as usize
        };
        let merged = merge_logs(increments, decrements, usize::MAX);
        for pair in merged.windows(2) {
            if pair[0].block_number == pair[1].block_number {
                prop_assert!(position(&pair[0]) < position(&pair[1]));
            }
        }
    }

    /// Property: the window ends at the latest block and spans at most the lookback
    #[test]
    fn prop_scan_window_bounds(latest in any::<u64>(), lookback in 0u64..10_000) {
        let (from, to) = scan_window(latest, lookback);
        prop_assert_eq!(to, latest);
        prop_assert!(from <= to);
        prop_assert!(to - from <= lookback);
    }
}

// ============================================================================
// Guard and Warning Properties
// ============================================================================

proptest! {
    /// Property: a mismatch blocks interaction regardless of other inputs
    #[test]
    fn prop_mismatch_blocks_interaction(
        active in chain_id_strategy(),
        expected in chain_id_strategy(),
        connected in any::<bool>(),
        has_contract in any::<bool>(),
    ) {
        let mut guard = NetworkGuard::new();
        guard.set_account(connected.then(|| address(1)));
        guard.set_active_network(active);
        guard.set_config(expected, has_contract.then(|| address(9)));

        if let (Some(a), Some(e)) = (active, expected) {
            if a != e {
                prop_assert!(guard.mismatched());
                prop_assert!(!guard.can_interact());
            }
        }
        prop_assert_eq!(
            guard.can_interact(),
            connected && has_contract && active.is_some() && active == expected
        );
    }

    /// Property: only a known zero is held back
    #[test]
    fn prop_warning_only_at_zero(value in prop::option::of(0u64..5)) {
        let mut policy = WarningPolicy::new();
        let decision = policy.request_decrement(value.map(CounterValue::from));
        match value {
            Some(0) => prop_assert!(matches!(decision, Decision::Warn(_))),
            _ => prop_assert_eq!(decision, Decision::Submit),
        }
    }
}
