//! Formal finite state machine for the restore lifecycle.
//!
//! Implements an explicit transition table with guards so that only valid
//! phase changes occur. The central guard is that a restore may enter
//! Complete only when the target VM is stopped and every volume has been
//! materialized: a restore issued against a running VM parks in InProgress
//! (no valid transition fires) until the VM stops.

use std::fmt;

use crate::crd::RestorePhase;

/// Events that trigger restore phase transitions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RestoreEvent {
    /// The per-VM lock is available and materialization may begin
    MaterializationRequested,
    /// The target VM is still running; the restore must keep waiting
    TargetRunning,
    /// Every volume has been rolled back to the snapshot content
    AllVolumesRestored,
    /// An error occurred while materializing
    RestoreFailed,
}

impl fmt::Display for RestoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreEvent::MaterializationRequested => write!(f, "MaterializationRequested"),
            RestoreEvent::TargetRunning => write!(f, "TargetRunning"),
            RestoreEvent::AllVolumesRestored => write!(f, "AllVolumesRestored"),
            RestoreEvent::RestoreFailed => write!(f, "RestoreFailed"),
        }
    }
}

/// Context information available during restore transitions
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Whether the target VM is fully stopped
    pub vm_stopped: bool,
    /// Whether this restore holds the per-VM lock
    pub lock_held: bool,
    /// Number of volumes in the snapshot
    pub volumes_total: usize,
    /// Number of volumes materialized so far
    pub volumes_restored: usize,
    /// Error message if materialization failed
    pub error_message: Option<String>,
}

impl TransitionContext {
    /// Create a new transition context
    pub fn new(vm_stopped: bool, volumes_total: usize) -> Self {
        Self {
            vm_stopped,
            lock_held: false,
            volumes_total,
            volumes_restored: 0,
            error_message: None,
        }
    }

    /// Check if every volume has been materialized
    pub fn all_volumes_restored(&self) -> bool {
        self.volumes_total > 0 && self.volumes_restored >= self.volumes_total
    }

    /// Set lock ownership
    pub fn with_lock_held(mut self, held: bool) -> Self {
        self.lock_held = held;
        self
    }

    /// Set materialization progress
    pub fn with_restored(mut self, restored: usize) -> Self {
        self.volumes_restored = restored;
        self
    }

    /// Set error message
    pub fn with_error(mut self, message: String) -> Self {
        self.error_message = Some(message);
        self
    }
}

/// A phase transition definition
#[derive(Debug)]
pub struct Transition {
    /// Source phase
    pub from: RestorePhase,
    /// Target phase
    pub to: RestorePhase,
    /// Event that triggers this transition
    pub event: RestoreEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: RestorePhase,
        to: RestorePhase,
        event: RestoreEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a phase transition
#[derive(Debug)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: RestorePhase,
        to: RestorePhase,
        event: RestoreEvent,
        description: &'static str,
    },
    /// Transition was not valid for current phase (restore stays put)
    InvalidTransition {
        current: RestorePhase,
        event: RestoreEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: RestorePhase,
        to: RestorePhase,
        event: RestoreEvent,
        reason: String,
    },
}

/// Formal state machine for the restore lifecycle
pub struct RestoreStateMachine {
    transitions: Vec<Transition>,
}

impl Default for RestoreStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        Self {
            transitions: vec![
                // === Created ===
                Transition::new(
                    RestorePhase::Created,
                    RestorePhase::InProgress,
                    RestoreEvent::MaterializationRequested,
                    "Restore accepted, beginning materialization",
                ),
                Transition::new(
                    RestorePhase::Created,
                    RestorePhase::Failed,
                    RestoreEvent::RestoreFailed,
                    "Restore rejected before materialization started",
                ),
                // === InProgress ===
                Transition::new(
                    RestorePhase::InProgress,
                    RestorePhase::Complete,
                    RestoreEvent::AllVolumesRestored,
                    "Every volume rolled back, restore committed",
                ),
                Transition::new(
                    RestorePhase::InProgress,
                    RestorePhase::Failed,
                    RestoreEvent::RestoreFailed,
                    "Error during materialization, prior disk state intact",
                ),
                // === Complete / Failed are terminal ===
                // TargetRunning deliberately has no transition anywhere:
                // a restore against a running VM parks where it is.
            ],
        }
    }

    /// Attempt a phase transition based on an event
    pub fn transition(
        &self,
        current: &RestorePhase,
        event: RestoreEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &RestorePhase, event: &RestoreEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given phase
    pub fn valid_events(&self, phase: &RestorePhase) -> Vec<&RestoreEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *phase)
            .map(|t| &t.event)
            .collect()
    }

    /// Check guard conditions for a transition
    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.to, &transition.event) {
            // Guard: materialization requires holding the per-VM lock
            (RestorePhase::InProgress, RestoreEvent::MaterializationRequested) => {
                if !ctx.lock_held {
                    Some("restore lock is held by another operation".to_string())
                } else {
                    None
                }
            }
            // Guard: Complete requires a stopped VM and every volume restored
            (RestorePhase::Complete, RestoreEvent::AllVolumesRestored) => {
                if !ctx.vm_stopped {
                    Some("target VM is not stopped".to_string())
                } else if !ctx.all_volumes_restored() {
                    Some(format!(
                        "only {}/{} volumes restored",
                        ctx.volumes_restored, ctx.volumes_total
                    ))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Determine the appropriate event based on context
pub fn determine_event(current_phase: &RestorePhase, ctx: &TransitionContext) -> RestoreEvent {
    // Errors always take priority
    if ctx.error_message.is_some() {
        return RestoreEvent::RestoreFailed;
    }

    match current_phase {
        RestorePhase::Created => RestoreEvent::MaterializationRequested,
        RestorePhase::InProgress => {
            if !ctx.vm_stopped {
                // Parks: TargetRunning has no valid transition
                RestoreEvent::TargetRunning
            } else if ctx.all_volumes_restored() {
                RestoreEvent::AllVolumesRestored
            } else {
                // Materialization continues within InProgress
                RestoreEvent::MaterializationRequested
            }
        }
        // Terminal phases accept no events
        RestorePhase::Complete | RestorePhase::Failed => RestoreEvent::TargetRunning,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    #[test]
    fn test_created_to_in_progress() {
        let sm = RestoreStateMachine::new();
        let ctx = TransitionContext::new(true, 1).with_lock_held(true);

        let result = sm.transition(
            &RestorePhase::Created,
            RestoreEvent::MaterializationRequested,
            &ctx,
        );

        match result {
            TransitionResult::Success { from, to, .. } => {
                assert_eq!(from, RestorePhase::Created);
                assert_eq!(to, RestorePhase::InProgress);
            }
            _ => panic!("Expected successful transition"),
        }
    }

    #[test]
    fn test_materialization_requires_lock() {
        let sm = RestoreStateMachine::new();
        let ctx = TransitionContext::new(true, 1);

        let result = sm.transition(
            &RestorePhase::Created,
            RestoreEvent::MaterializationRequested,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));
    }

    #[test]
    fn test_complete_requires_stopped_vm() {
        let sm = RestoreStateMachine::new();

        // Running VM: guard blocks Complete
        let ctx = TransitionContext::new(false, 2).with_restored(2);
        let result = sm.transition(
            &RestorePhase::InProgress,
            RestoreEvent::AllVolumesRestored,
            &ctx,
        );
        match result {
            TransitionResult::GuardFailed { reason, .. } => {
                assert!(reason.contains("not stopped"));
            }
            _ => panic!("Expected guard failure"),
        }

        // Stopped VM with all volumes restored: Complete
        let ctx = TransitionContext::new(true, 2).with_restored(2);
        let result = sm.transition(
            &RestorePhase::InProgress,
            RestoreEvent::AllVolumesRestored,
            &ctx,
        );
        assert!(matches!(
            result,
            TransitionResult::Success {
                to: RestorePhase::Complete,
                ..
            }
        ));
    }

    #[test]
    fn test_complete_requires_every_volume() {
        let sm = RestoreStateMachine::new();
        let ctx = TransitionContext::new(true, 3).with_restored(2);

        let result = sm.transition(
            &RestorePhase::InProgress,
            RestoreEvent::AllVolumesRestored,
            &ctx,
        );
        match result {
            TransitionResult::GuardFailed { reason, .. } => {
                assert!(reason.contains("2/3"));
            }
            _ => panic!("Expected guard failure"),
        }
    }

    #[test]
    fn test_target_running_parks_everywhere() {
        let sm = RestoreStateMachine::new();
        let ctx = TransitionContext::new(false, 1);

        for phase in [
            RestorePhase::Created,
            RestorePhase::InProgress,
            RestorePhase::Complete,
            RestorePhase::Failed,
        ] {
            let result = sm.transition(&phase, RestoreEvent::TargetRunning, &ctx);
            assert!(
                matches!(result, TransitionResult::InvalidTransition { .. }),
                "TargetRunning must never transition from {:?}",
                phase
            );
        }
    }

    #[test]
    fn test_terminal_phases_accept_no_events() {
        let sm = RestoreStateMachine::new();
        assert!(sm.valid_events(&RestorePhase::Complete).is_empty());
        assert!(sm.valid_events(&RestorePhase::Failed).is_empty());
    }

    #[test]
    fn test_failure_possible_from_both_active_phases() {
        let sm = RestoreStateMachine::new();
        assert!(sm.can_transition(&RestorePhase::Created, &RestoreEvent::RestoreFailed));
        assert!(sm.can_transition(&RestorePhase::InProgress, &RestoreEvent::RestoreFailed));
    }

    #[test]
    fn test_determine_event_error_priority() {
        let ctx = TransitionContext::new(true, 1)
            .with_restored(1)
            .with_error("content handle missing".to_string());
        assert_eq!(
            determine_event(&RestorePhase::InProgress, &ctx),
            RestoreEvent::RestoreFailed
        );
    }

    #[test]
    fn test_determine_event_running_vm_parks() {
        let ctx = TransitionContext::new(false, 1).with_restored(1);
        assert_eq!(
            determine_event(&RestorePhase::InProgress, &ctx),
            RestoreEvent::TargetRunning
        );
    }

    #[test]
    fn test_determine_event_stopped_vm_completes() {
        let ctx = TransitionContext::new(true, 1).with_restored(1);
        assert_eq!(
            determine_event(&RestorePhase::InProgress, &ctx),
            RestoreEvent::AllVolumesRestored
        );
    }
}
