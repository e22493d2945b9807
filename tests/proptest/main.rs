// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for vm-storage-coordinator.
//!
//! Uses proptest to generate random inputs and verify invariants:
//! capacity arithmetic is exact, the resize tolerance band is tight, the
//! clone size floor is a total order on bytes, and the restore state
//! machine's terminal phases and guards hold for arbitrary inputs.

use proptest::prelude::*;

use vm_storage_coordinator::coordinator::state_machine::{
    RestoreEvent, RestoreStateMachine, TransitionContext, TransitionResult,
};
use vm_storage_coordinator::coordinator::{
    add_bytes, format_bytes, grow_delta, parse_quantity, validate_clone_size, within_tolerance,
};
use vm_storage_coordinator::crd::RestorePhase;

/// Strategy for generating binary unit suffixes with their multipliers.
fn binary_suffix() -> impl Strategy<Value = (&'static str, u64)> {
    prop_oneof![
        Just(("", 1u64)),
        Just(("Ki", 1u64 << 10)),
        Just(("Mi", 1u64 << 20)),
        Just(("Gi", 1u64 << 30)),
        Just(("Ti", 1u64 << 40)),
    ]
}

/// Strategy for generating random restore phases.
fn any_phase() -> impl Strategy<Value = RestorePhase> {
    prop_oneof![
        Just(RestorePhase::Created),
        Just(RestorePhase::InProgress),
        Just(RestorePhase::Complete),
        Just(RestorePhase::Failed),
    ]
}

/// Strategy for generating random restore events.
fn any_event() -> impl Strategy<Value = RestoreEvent> {
    prop_oneof![
        Just(RestoreEvent::MaterializationRequested),
        Just(RestoreEvent::TargetRunning),
        Just(RestoreEvent::AllVolumesRestored),
        Just(RestoreEvent::RestoreFailed),
    ]
}

proptest! {
    /// Property: formatting a byte count and parsing it back is lossless.
    #[test]
    fn test_quantity_round_trip(bytes in any::<u64>()) {
        prop_assert_eq!(parse_quantity(&format_bytes(bytes)).unwrap(), bytes);
    }

    /// Property: suffixed quantities parse to value times multiplier.
    #[test]
    fn test_suffixed_quantities_exact(
        value in 0u64..1_000_000,
        (suffix, multiplier) in binary_suffix()
    ) {
        let parsed = parse_quantity(&format!("{}{}", value, suffix)).unwrap();
        prop_assert_eq!(parsed, value * multiplier);
    }

    /// Property: adding a delta is exact integer arithmetic, and repeated
    /// round trips through the string form never drift.
    #[test]
    fn test_add_is_exact_and_stable(
        base in 0u64..(1u64 << 40),
        delta in 0u64..(1u64 << 30)
    ) {
        let sum = add_bytes(&format_bytes(base), delta).unwrap();
        prop_assert_eq!(sum, base + delta);
        let again = add_bytes(&format_bytes(sum), 0).unwrap();
        prop_assert_eq!(again, sum);
    }

    /// Property: a resize to an absolute size yields a delta exactly when
    /// it grows the claim; every shrink is rejected.
    #[test]
    fn test_grow_delta_rejects_every_shrink(
        current in 0u64..(1u64 << 40),
        requested in 0u64..(1u64 << 40)
    ) {
        match grow_delta(current, requested) {
            Ok(delta) => {
                prop_assert!(requested >= current);
                prop_assert_eq!(delta, requested - current);
            }
            Err(_) => prop_assert!(requested < current),
        }
    }

    /// Property: the tolerance band accepts exactly target and target+1.
    #[test]
    fn test_tolerance_band_is_tight(
        baseline in 0u64..1_000,
        expected in 0u64..100,
        observed in 0u64..2_000
    ) {
        let target = baseline + expected;
        let accepted = within_tolerance(baseline, expected, observed);
        prop_assert_eq!(accepted, observed == target || observed == target + 1);
    }

    /// Property: a clone is allowed iff the requested byte count is at
    /// least the source byte count.
    #[test]
    fn test_clone_floor_total_order(
        source in 1u64..(1u64 << 44),
        requested in 1u64..(1u64 << 44)
    ) {
        let result = validate_clone_size(&format_bytes(source), &format_bytes(requested));
        prop_assert_eq!(result.is_ok(), requested >= source);
    }

    /// Property: terminal phases admit no transitions, for any event.
    #[test]
    fn test_terminal_phases_are_terminal(event in any_event()) {
        let sm = RestoreStateMachine::new();
        prop_assert!(!sm.can_transition(&RestorePhase::Complete, &event));
        prop_assert!(!sm.can_transition(&RestorePhase::Failed, &event));
    }

    /// Property: TargetRunning never moves any phase anywhere.
    #[test]
    fn test_target_running_always_parks(phase in any_phase()) {
        let sm = RestoreStateMachine::new();
        prop_assert!(!sm.can_transition(&phase, &RestoreEvent::TargetRunning));
    }

    /// Property: Complete is unreachable while the VM runs or volumes are
    /// missing, whatever the counts.
    #[test]
    fn test_complete_guard_holds(
        phase in any_phase(),
        vm_stopped in any::<bool>(),
        total in 0usize..16,
        restored in 0usize..16
    ) {
        let sm = RestoreStateMachine::new();
        let ctx = TransitionContext::new(vm_stopped, total)
            .with_lock_held(true)
            .with_restored(restored);
        let result = sm.transition(&phase, RestoreEvent::AllVolumesRestored, &ctx);
        if let TransitionResult::Success { to, .. } = result {
            prop_assert_eq!(to, RestorePhase::Complete);
            prop_assert!(vm_stopped);
            prop_assert!(total > 0 && restored >= total);
        }
    }

    /// Property: transition checks are deterministic.
    #[test]
    fn test_transitions_deterministic(phase in any_phase(), event in any_event()) {
        let sm = RestoreStateMachine::new();
        let first = sm.can_transition(&phase, &event);
        let second = sm.can_transition(&phase, &event);
        prop_assert_eq!(first, second);
    }
}
