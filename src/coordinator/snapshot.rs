//! Snapshot Manager: point-in-time disk state capture.
//!
//! Snapshots can be taken against a running or a stopped VM; the storage
//! backend handles the content freeze either way. Two rules shape this
//! module: a snapshot is usable only once `status.readyToUse` is true, and
//! a snapshot must outlive its source VM. The second rule is why created
//! snapshots carry no owner reference to the VM.

use std::time::Duration;

use kube::ResourceExt;
use kube::api::{Api, DeleteParams, PostParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::context::Context;
use super::error::{Error, Result};
use super::poll::poll_until;
use crate::crd::{
    SnapshotSource, VirtualMachine, VirtualMachineSnapshot, VirtualMachineSnapshotSpec,
};

/// How often to re-read a pending snapshot.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Budget for the storage backend to freeze content.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Tunables for the snapshot manager.
#[derive(Debug, Clone)]
pub struct SnapshotManagerConfig {
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for SnapshotManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Creates snapshots and tracks them to readiness.
pub struct SnapshotManager {
    ctx: Context,
    config: SnapshotManagerConfig,
}

impl SnapshotManager {
    pub fn new(ctx: Context) -> Self {
        Self::with_config(ctx, SnapshotManagerConfig::default())
    }

    pub fn with_config(ctx: Context, config: SnapshotManagerConfig) -> Self {
        Self { ctx, config }
    }

    /// Create a snapshot of the named VM's volumes.
    ///
    /// The VM may be running or stopped. The created object deliberately
    /// has no owner reference: deleting the VM later must leave the
    /// snapshot present and `readyToUse`.
    pub async fn create_snapshot(
        &self,
        namespace: &str,
        snapshot_name: &str,
        vm_name: &str,
    ) -> Result<VirtualMachineSnapshot> {
        let vms: Api<VirtualMachine> = Api::namespaced(self.ctx.client.clone(), namespace);
        let vm = vms.get(vm_name).await?;
        if vm.spec.volumes.is_empty() {
            return Err(Error::PreconditionNotMet(format!(
                "VM '{}' has no volumes to snapshot",
                vm_name
            )));
        }

        let snapshot = snapshot_object(snapshot_name, vm_name);

        let api: Api<VirtualMachineSnapshot> =
            Api::namespaced(self.ctx.client.clone(), namespace);
        let created = api.create(&PostParams::default(), &snapshot).await?;

        info!(
            namespace = %namespace,
            snapshot = %snapshot_name,
            vm = %vm_name,
            running = vm.is_running(),
            "Snapshot requested"
        );
        if let Some(state) = &self.ctx.health_state {
            state.metrics.record_snapshot_created(namespace);
        }
        self.ctx
            .publish_normal_event(
                &created,
                "SnapshotRequested",
                "CreateSnapshot",
                Some(format!("snapshot of VM '{}' requested", vm_name)),
            )
            .await;

        Ok(created)
    }

    /// Wait until the snapshot's content freeze has completed.
    ///
    /// Returns the ready snapshot, including its populated volume backups.
    pub async fn wait_ready(
        &self,
        namespace: &str,
        snapshot_name: &str,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<VirtualMachineSnapshot> {
        let api: Api<VirtualMachineSnapshot> =
            Api::namespaced(self.ctx.client.clone(), namespace);
        let timeout = timeout.unwrap_or(self.config.ready_timeout);
        let cancel = cancel.unwrap_or_default();

        debug!(namespace = %namespace, snapshot = %snapshot_name, "Awaiting snapshot readiness");

        let result = poll_until(
            self.config.poll_interval,
            timeout,
            &cancel,
            || async { api.get(snapshot_name).await.map_err(Error::from) },
            VirtualMachineSnapshot::is_ready_to_use,
        )
        .await?;

        let snapshot = result.last_observed;
        if !result.reached_target {
            let phase = snapshot
                .status
                .as_ref()
                .map(|s| s.phase.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::PreconditionNotMet(format!(
                "snapshot '{}' not readyToUse after {:?} (phase {})",
                snapshot_name, timeout, phase
            )));
        }

        info!(
            namespace = %namespace,
            snapshot = %snapshot_name,
            volumes = snapshot.volume_backups().len(),
            "Snapshot ready to use"
        );
        Ok(snapshot)
    }

    /// Delete a snapshot. Absence is success.
    pub async fn delete_snapshot(&self, namespace: &str, snapshot_name: &str) -> Result<()> {
        let api: Api<VirtualMachineSnapshot> =
            Api::namespaced(self.ctx.client.clone(), namespace);
        match api.delete(snapshot_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %namespace, snapshot = %snapshot_name, "Snapshot deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Build the snapshot object for a VM.
///
/// No owner reference is set: the snapshot must survive deletion of its
/// source VM, so garbage collection must never chain from the VM to it.
pub fn snapshot_object(snapshot_name: &str, vm_name: &str) -> VirtualMachineSnapshot {
    VirtualMachineSnapshot::new(
        snapshot_name,
        VirtualMachineSnapshotSpec {
            source: SnapshotSource {
                name: vm_name.to_string(),
            },
        },
    )
}

/// Fetch a snapshot and require it to be ready for restore use.
pub async fn get_ready_snapshot(
    ctx: &Context,
    namespace: &str,
    snapshot_name: &str,
) -> Result<VirtualMachineSnapshot> {
    let api: Api<VirtualMachineSnapshot> = Api::namespaced(ctx.client.clone(), namespace);
    let snapshot = api.get(snapshot_name).await?;
    if !snapshot.is_ready_to_use() {
        return Err(Error::PreconditionNotMet(format!(
            "snapshot '{}' is not readyToUse",
            snapshot.name_any()
        )));
    }
    Ok(snapshot)
}
