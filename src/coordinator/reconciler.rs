//! Reconciliation loop for VirtualMachineRestore.
//!
//! One phase step per reconcile pass. A restore whose target VM is running
//! parks: its status is written with `complete=false` and both the Ready
//! and Progressing conditions False, and the pass requeues until the VM
//! stops. No phase change happens while parked. Completion both repoints
//! the VM at the restored claims and flips `complete=true` in one pass, so
//! observers never see a completed restore with stale disks.

use std::sync::Arc;
use std::time::Instant;

use kube::{
    Api, ResourceExt,
    api::{ListParams, Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::error::Error;
use super::lock::RestoreLock;
use super::restore::RestoreOrchestrator;
use super::snapshot::get_ready_snapshot;
use super::state_machine::{
    RestoreStateMachine, TransitionContext, TransitionResult, determine_event,
};
use crate::crd::{
    Condition, RestorePhase, VirtualMachine, VirtualMachineRestore, VirtualMachineRestoreStatus,
    VolumeRestore,
};

/// Finalizer guarding restore cleanup (lock release).
pub const FINALIZER: &str = "virtcoord.io/restore-protection";

/// Reconcile a VirtualMachineRestore.
pub async fn reconcile(
    obj: Arc<VirtualMachineRestore>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling VirtualMachineRestore");

    let api: Api<VirtualMachineRestore> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &namespace).await;
    }

    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        debug!(name = %name, "Adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(std::time::Duration::from_secs(1)));
    }

    let current_phase = obj.phase();
    if current_phase.is_terminal() {
        return Ok(Action::await_change());
    }

    // Target VM and snapshot must both exist; a missing target is a
    // terminal failure, not something a requeue can fix.
    let vms: Api<VirtualMachine> = Api::namespaced(ctx.client.clone(), &namespace);
    let vm = match vms.get(&obj.spec.target_name).await {
        Ok(vm) => vm,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            let msg = format!("target VM '{}' not found", obj.spec.target_name);
            return fail_restore(&api, &obj, &ctx, &msg).await;
        }
        Err(e) => return Err(e.into()),
    };
    let snapshot = match get_ready_snapshot(&ctx, &namespace, &obj.spec.snapshot_name).await {
        Ok(s) => s,
        Err(e) if e.is_not_found() => {
            let msg = format!("snapshot '{}' not found", obj.spec.snapshot_name);
            return fail_restore(&api, &obj, &ctx, &msg).await;
        }
        // Not ready yet: stay pending
        Err(e) => return Err(e),
    };

    let vm_stopped = vm.is_stopped();
    let volumes_total = snapshot.volume_backups().len();

    // Park against a running target: status says exactly why, no phase
    // movement, and the pass retries until the VM stops.
    if !vm_stopped {
        park_restore(&api, &obj, &ctx, &vm).await?;
        return Ok(Action::requeue(std::time::Duration::from_secs(10)));
    }

    let lock = RestoreLock::new(ctx.client.clone(), &namespace, &obj.spec.target_name);
    lock.acquire_with_owner(&name, &vm).await?;

    let state_machine = RestoreStateMachine::new();
    let tcx = TransitionContext::new(vm_stopped, volumes_total).with_lock_held(true);

    let next = match current_phase {
        RestorePhase::Created => {
            let event = determine_event(&current_phase, &tcx);
            match state_machine.transition(&current_phase, event, &tcx) {
                TransitionResult::Success { to, description, .. } => {
                    info!(name = %name, to = %to, "{}", description);
                    ctx.publish_normal_event(
                        obj.as_ref(),
                        "RestoreStarted",
                        "Materializing",
                        Some(format!(
                            "materializing snapshot '{}' onto VM '{}'",
                            obj.spec.snapshot_name, obj.spec.target_name
                        )),
                    )
                    .await;
                    StatusUpdate::in_progress(&obj)
                }
                TransitionResult::GuardFailed { reason, .. } => {
                    return Err(Error::PreconditionNotMet(reason));
                }
                TransitionResult::InvalidTransition { .. } => {
                    return Ok(Action::await_change());
                }
            }
        }
        RestorePhase::InProgress => {
            let orchestrator = RestoreOrchestrator::new(ctx.as_ref().clone());
            match orchestrator.materialize(&obj, &vm, &snapshot).await {
                Ok(restores) => {
                    let tcx = tcx.with_restored(restores.len());
                    let event = determine_event(&current_phase, &tcx);
                    match state_machine.transition(&current_phase, event, &tcx) {
                        TransitionResult::Success { to, description, .. } => {
                            info!(name = %name, to = %to, "{}", description);
                            ctx.publish_normal_event(
                                obj.as_ref(),
                                "RestoreComplete",
                                "Materializing",
                                Some(format!("{} volumes restored", restores.len())),
                            )
                            .await;
                            lock.release(&name).await?;
                            StatusUpdate::complete(&obj, restores)
                        }
                        TransitionResult::GuardFailed { reason, .. } => {
                            return Err(Error::PreconditionNotMet(reason));
                        }
                        TransitionResult::InvalidTransition { .. } => {
                            return Ok(Action::await_change());
                        }
                    }
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    lock.release(&name).await?;
                    return fail_restore(&api, &obj, &ctx, &e.to_string()).await;
                }
            }
        }
        // Terminal phases returned early above
        RestorePhase::Complete | RestorePhase::Failed => return Ok(Action::await_change()),
    };

    let terminal = next.status.phase.is_terminal();
    patch_status(&api, &ctx, &name, next.status).await?;

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_reconcile(&namespace, &name, start_time.elapsed().as_secs_f64());
        health_state.mark_reconciled();
    }

    if terminal {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(std::time::Duration::from_secs(1)))
    }
}

/// Error policy for the restore controller.
pub fn error_policy(
    obj: Arc<VirtualMachineRestore>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(std::time::Duration::from_secs(300))
    }
}

/// A pending status write plus its phase.
struct StatusUpdate {
    status: VirtualMachineRestoreStatus,
}

impl StatusUpdate {
    fn in_progress(obj: &VirtualMachineRestore) -> Self {
        let generation = obj.metadata.generation;
        Self {
            status: VirtualMachineRestoreStatus {
                complete: Some(false),
                phase: RestorePhase::InProgress,
                restore_time: None,
                restores: vec![],
                conditions: vec![
                    Condition::ready(false, "Materializing", "restore in progress", generation),
                    Condition::progressing(
                        true,
                        "Materializing",
                        "restore in progress",
                        generation,
                    ),
                ],
            },
        }
    }

    fn complete(obj: &VirtualMachineRestore, restores: Vec<VolumeRestore>) -> Self {
        let generation = obj.metadata.generation;
        Self {
            status: VirtualMachineRestoreStatus {
                complete: Some(true),
                phase: RestorePhase::Complete,
                restore_time: Some(jiff::Timestamp::now().to_string()),
                restores,
                conditions: vec![
                    Condition::ready(true, "Operational", "all volumes restored", generation),
                    Condition::progressing(false, "Complete", "restore finished", generation),
                ],
            },
        }
    }
}

/// Write the parked state for a restore whose target VM is running.
async fn park_restore(
    api: &Api<VirtualMachineRestore>,
    obj: &VirtualMachineRestore,
    ctx: &Context,
    vm: &VirtualMachine,
) -> Result<(), Error> {
    let name = obj.name_any();
    let generation = obj.metadata.generation;
    let message = format!("target VM '{}' is running", vm.name_any());

    // Only warn on the first pass into the parked state
    let already_parked = obj
        .status
        .as_ref()
        .is_some_and(|s| s.conditions.iter().any(|c| c.reason == "WaitingForTarget"));
    if !already_parked {
        warn!(name = %name, "{}", message);
        ctx.publish_warning_event(obj, "TargetRunning", "WaitingForTarget", Some(message.clone()))
            .await;
    }

    let status = VirtualMachineRestoreStatus {
        complete: Some(false),
        phase: RestorePhase::InProgress,
        restore_time: None,
        restores: obj
            .status
            .as_ref()
            .map(|s| s.restores.clone())
            .unwrap_or_default(),
        conditions: vec![
            Condition::ready(false, "WaitingForTarget", &message, generation),
            Condition::progressing(false, "WaitingForTarget", &message, generation),
        ],
    };
    patch_status(api, ctx, &name, status).await
}

/// Mark a restore Failed. Prior disk state stays intact: the status never
/// claims completion and the VM spec was never repointed.
async fn fail_restore(
    api: &Api<VirtualMachineRestore>,
    obj: &VirtualMachineRestore,
    ctx: &Context,
    message: &str,
) -> Result<Action, Error> {
    let name = obj.name_any();
    let generation = obj.metadata.generation;
    error!(name = %name, "Restore failed: {}", message);
    ctx.publish_warning_event(obj, "RestoreFailed", "Materializing", Some(message.to_string()))
        .await;

    let status = VirtualMachineRestoreStatus {
        complete: obj.status.as_ref().and_then(|s| s.complete),
        phase: RestorePhase::Failed,
        restore_time: None,
        restores: obj
            .status
            .as_ref()
            .map(|s| s.restores.clone())
            .unwrap_or_default(),
        conditions: vec![
            Condition::ready(false, "RestoreFailed", message, generation),
            Condition::progressing(false, "RestoreFailed", message, generation),
        ],
    };
    patch_status(api, ctx, &name, status).await?;
    Ok(Action::await_change())
}

/// Handle deletion of a restore: release the lock it may hold, then drop
/// the finalizer.
async fn handle_deletion(
    obj: &VirtualMachineRestore,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let name = obj.name_any();
    info!(name = %name, "Handling restore deletion");

    let lock = RestoreLock::new(ctx.client.clone(), namespace, &obj.spec.target_name);
    lock.release(&name).await?;

    let api: Api<VirtualMachineRestore> = Api::namespaced(ctx.client.clone(), namespace);
    remove_finalizer(&api, &name).await?;

    Ok(Action::await_change())
}

async fn add_finalizer(api: &Api<VirtualMachineRestore>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<VirtualMachineRestore>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": null
        }
    });
    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn patch_status(
    api: &Api<VirtualMachineRestore>,
    ctx: &Context,
    name: &str,
    status: VirtualMachineRestoreStatus,
) -> Result<(), Error> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    refresh_phase_gauges(api, ctx).await;
    Ok(())
}

/// Recount restores by phase after a status write, best effort.
async fn refresh_phase_gauges(api: &Api<VirtualMachineRestore>, ctx: &Context) {
    let Some(ref health_state) = ctx.health_state else {
        return;
    };
    match api.list(&ListParams::default()).await {
        Ok(list) => {
            for (phase, count) in phase_counts(&list.items) {
                health_state
                    .metrics
                    .set_restores_by_phase(&phase.to_string(), count);
            }
        }
        Err(e) => debug!(error = %e, "Failed to list restores for phase gauges"),
    }
}

/// Count restores in each phase. Every phase gets an entry so gauges drop
/// back to zero when the last restore in a phase moves on.
pub(crate) fn phase_counts(restores: &[VirtualMachineRestore]) -> [(RestorePhase, i64); 4] {
    let mut counts = [
        (RestorePhase::Created, 0i64),
        (RestorePhase::InProgress, 0),
        (RestorePhase::Complete, 0),
        (RestorePhase::Failed, 0),
    ];
    for restore in restores {
        let phase = restore.phase();
        for slot in &mut counts {
            if slot.0 == phase {
                slot.1 += 1;
            }
        }
    }
    counts
}
