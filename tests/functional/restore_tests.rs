//! Restore lifecycle scenarios driven through the production state machine.
//!
//! A `MockRestoreState` simulates only the external facts (VM stopped or
//! running, lock held, volumes materialized); event determination and
//! transition guards are the real implementations, so these scenarios stay
//! in sync with the reconciler automatically.

use vm_storage_coordinator::coordinator::state_machine::{
    RestoreEvent, RestoreStateMachine, TransitionContext, TransitionResult, determine_event,
};
use vm_storage_coordinator::crd::RestorePhase;
use vm_storage_coordinator::guest::{GuestRef, file_sha256};

use crate::mock_guest::MockGuest;

/// Logical state of one restore and its target VM.
#[derive(Debug, Clone)]
struct MockRestoreState {
    phase: RestorePhase,
    vm_stopped: bool,
    lock_held: bool,
    volumes_total: usize,
    volumes_restored: usize,
    error: Option<String>,
    /// status.complete as last written
    complete: Option<bool>,
    /// Whether the last pass parked (conditions both False)
    parked: bool,
}

impl MockRestoreState {
    fn new(volumes_total: usize, vm_stopped: bool) -> Self {
        Self {
            phase: RestorePhase::Created,
            vm_stopped,
            lock_held: true,
            volumes_total,
            volumes_restored: 0,
            error: None,
            complete: None,
            parked: false,
        }
    }

    fn transition_context(&self) -> TransitionContext {
        let mut ctx = TransitionContext::new(self.vm_stopped, self.volumes_total)
            .with_lock_held(self.lock_held)
            .with_restored(self.volumes_restored);
        if let Some(msg) = &self.error {
            ctx = ctx.with_error(msg.clone());
        }
        ctx
    }

    /// One reconcile pass: park against a running VM, otherwise let the
    /// state machine decide. Materialization succeeds whole (all volumes)
    /// unless an error is injected, mirroring all-or-nothing staging.
    fn step(&mut self) {
        if self.phase.is_terminal() {
            return;
        }

        // A running target parks the restore before any phase logic.
        if !self.vm_stopped && self.error.is_none() {
            self.phase = RestorePhase::InProgress;
            self.complete = Some(false);
            self.parked = true;
            return;
        }
        self.parked = false;

        if self.phase == RestorePhase::InProgress && self.error.is_none() {
            self.volumes_restored = self.volumes_total;
        }

        let ctx = self.transition_context();
        let event = determine_event(&self.phase, &ctx);
        let sm = RestoreStateMachine::new();
        match sm.transition(&self.phase, event, &ctx) {
            TransitionResult::Success { to, .. } => {
                self.phase = to;
                match to {
                    RestorePhase::InProgress => self.complete = Some(false),
                    RestorePhase::Complete => self.complete = Some(true),
                    _ => {}
                }
            }
            TransitionResult::GuardFailed { .. } | TransitionResult::InvalidTransition { .. } => {}
        }
    }

    fn run(&mut self, passes: usize) {
        for _ in 0..passes {
            self.step();
        }
    }
}

#[test]
fn test_lifecycle_against_stopped_vm() {
    let mut state = MockRestoreState::new(2, true);

    state.step();
    assert_eq!(state.phase, RestorePhase::InProgress);
    assert_eq!(state.complete, Some(false));

    state.step();
    assert_eq!(state.phase, RestorePhase::Complete);
    assert_eq!(state.complete, Some(true));
    assert_eq!(state.volumes_restored, 2);
}

#[test]
fn test_restore_parks_until_vm_stops() {
    let mut state = MockRestoreState::new(1, false);

    // Any number of passes against a running VM: parked, never complete
    state.run(10);
    assert_eq!(state.phase, RestorePhase::InProgress);
    assert_eq!(state.complete, Some(false));
    assert!(state.parked);
    assert_eq!(state.volumes_restored, 0);

    // VM stops: the next pass materializes and commits
    state.vm_stopped = true;
    state.step();
    assert_eq!(state.phase, RestorePhase::Complete);
    assert_eq!(state.complete, Some(true));
    assert!(!state.parked);
}

#[test]
fn test_second_restore_blocked_until_lock_released() {
    let mut state = MockRestoreState::new(1, true);
    state.lock_held = false;

    // Lock held by the first restore: no phase movement
    state.run(5);
    assert_eq!(state.phase, RestorePhase::Created);

    // First restore finished, lock released
    state.lock_held = true;
    state.run(2);
    assert_eq!(state.phase, RestorePhase::Complete);
}

#[test]
fn test_failure_during_materialization_is_terminal() {
    let mut state = MockRestoreState::new(2, true);
    state.step();
    assert_eq!(state.phase, RestorePhase::InProgress);

    state.error = Some("content handle missing".to_string());
    state.step();
    assert_eq!(state.phase, RestorePhase::Failed);
    // The status never claimed completion
    assert_eq!(state.complete, Some(false));

    // Terminal: clearing the error and stopping the VM changes nothing
    state.error = None;
    state.run(5);
    assert_eq!(state.phase, RestorePhase::Failed);
}

#[test]
fn test_partial_materialization_does_not_complete() {
    let sm = RestoreStateMachine::new();
    let ctx = TransitionContext::new(true, 3)
        .with_lock_held(true)
        .with_restored(2);

    // determine_event keeps materializing while volumes are missing
    assert_eq!(
        determine_event(&RestorePhase::InProgress, &ctx),
        RestoreEvent::MaterializationRequested
    );
    // and a premature AllVolumesRestored is stopped by the guard
    let result = sm.transition(
        &RestorePhase::InProgress,
        RestoreEvent::AllVolumesRestored,
        &ctx,
    );
    assert!(matches!(result, TransitionResult::GuardFailed { .. }));
}

#[test]
fn test_terminal_phases_admit_no_events() {
    let sm = RestoreStateMachine::new();
    assert!(sm.valid_events(&RestorePhase::Complete).is_empty());
    assert!(sm.valid_events(&RestorePhase::Failed).is_empty());
}

#[test]
fn test_sequential_restores_of_same_vm() {
    // Two restores one after another, each holding the lock for its run.
    let mut first = MockRestoreState::new(1, true);
    first.run(2);
    assert_eq!(first.phase, RestorePhase::Complete);

    let mut second = MockRestoreState::new(1, true);
    second.run(2);
    assert_eq!(second.phase, RestorePhase::Complete);
}

#[tokio::test]
async fn test_restore_of_earlier_snapshot_recovers_its_checksum() {
    // Two snapshots of the same file, taken around a content change. A
    // restore of the earlier one must yield the earlier checksum even
    // though the later snapshot still exists.
    const DATA_FILE: &str = "/root/random_data_file";
    let guest = MockGuest::new();
    let gref = GuestRef::new("storage-tests", "rhel-guest");

    guest.set_file_hash(DATA_FILE, "5fd4a7ea");
    let checksum_at_first = file_sha256(&guest, &gref, DATA_FILE).await.unwrap();

    // Guest keeps writing before the second snapshot freezes
    guest.set_file_hash(DATA_FILE, "93c1b0de");
    let checksum_at_second = file_sha256(&guest, &gref, DATA_FILE).await.unwrap();
    assert_ne!(checksum_at_first, checksum_at_second);

    // Restore the first snapshot against the stopped VM
    let mut restore = MockRestoreState::new(1, true);
    restore.run(2);
    assert_eq!(restore.phase, RestorePhase::Complete);
    guest.set_file_hash(DATA_FILE, &checksum_at_first);

    let checksum_after_restore = file_sha256(&guest, &gref, DATA_FILE).await.unwrap();
    assert_eq!(checksum_after_restore, checksum_at_first);
    assert_ne!(checksum_after_restore, checksum_at_second);
}
