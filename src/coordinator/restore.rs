//! Restore Orchestrator: materializing snapshot content onto a VM.
//!
//! Materialization is all-or-nothing. Restored claims are staged as scoped
//! objects while they are created one by one; only once every volume in the
//! snapshot has a restored claim is the VM spec repointed and the staging
//! persisted. Any failure on the way drops the staged claims, leaving the
//! VM's previous disk state fully intact.
//!
//! The snapshot is a weak reference: its content handles are read during
//! materialization and never needed again, so deleting the snapshot after a
//! restore completes does not affect the restored VM.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams, PostParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capacity::format_bytes;
use super::context::Context;
use super::error::{Error, Result};
use super::poll::poll_until;
use super::scoped::ScopedObject;
use crate::crd::{
    API_GROUP, VirtualMachine, VirtualMachineRestore, VirtualMachineRestoreSpec,
    VirtualMachineSnapshot, VolumeRestore,
};

/// Annotation on restored claims naming the frozen content they were
/// provisioned from.
pub const CONTENT_HANDLE_ANNOTATION: &str = "virtcoord.io/content-handle";

/// How often to re-read a pending restore.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Budget for a restore against a stopped VM to commit.
const DEFAULT_COMPLETE_TIMEOUT: Duration = Duration::from_secs(180);

/// Tunables for the restore orchestrator.
#[derive(Debug, Clone)]
pub struct RestoreOrchestratorConfig {
    pub poll_interval: Duration,
    pub complete_timeout: Duration,
}

impl Default for RestoreOrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            complete_timeout: DEFAULT_COMPLETE_TIMEOUT,
        }
    }
}

/// Drives snapshot content back onto a target VM.
pub struct RestoreOrchestrator {
    ctx: Context,
    config: RestoreOrchestratorConfig,
}

impl RestoreOrchestrator {
    pub fn new(ctx: Context) -> Self {
        Self::with_config(ctx, RestoreOrchestratorConfig::default())
    }

    pub fn with_config(ctx: Context, config: RestoreOrchestratorConfig) -> Self {
        Self { ctx, config }
    }

    /// Submit a restore of `snapshot_name` onto `target_name`.
    ///
    /// Returns immediately; the reconciler drives the restore from here.
    pub async fn start_restore(
        &self,
        namespace: &str,
        restore_name: &str,
        target_name: &str,
        snapshot_name: &str,
    ) -> Result<VirtualMachineRestore> {
        let restore = VirtualMachineRestore::new(
            restore_name,
            VirtualMachineRestoreSpec {
                target_name: target_name.to_string(),
                snapshot_name: snapshot_name.to_string(),
            },
        );
        let api: Api<VirtualMachineRestore> =
            Api::namespaced(self.ctx.client.clone(), namespace);
        let created = api.create(&PostParams::default(), &restore).await?;
        info!(
            namespace = %namespace,
            restore = %restore_name,
            vm = %target_name,
            snapshot = %snapshot_name,
            "Restore submitted"
        );
        Ok(created)
    }

    /// Wait until a restore reaches `complete=true`.
    ///
    /// A restore parked against a running VM never satisfies this; the
    /// wait times out with the parked state described in the error.
    pub async fn wait_complete(
        &self,
        namespace: &str,
        restore_name: &str,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<VirtualMachineRestore> {
        let api: Api<VirtualMachineRestore> =
            Api::namespaced(self.ctx.client.clone(), namespace);
        let timeout = timeout.unwrap_or(self.config.complete_timeout);
        let cancel = cancel.unwrap_or_default();

        let result = poll_until(
            self.config.poll_interval,
            timeout,
            &cancel,
            || async { api.get(restore_name).await.map_err(Error::from) },
            VirtualMachineRestore::is_complete,
        )
        .await?;

        let restore = result.last_observed;
        if !result.reached_target {
            return Err(Error::PreconditionNotMet(format!(
                "restore '{}' not complete after {:?} (phase {})",
                restore_name,
                timeout,
                restore.phase()
            )));
        }
        info!(namespace = %namespace, restore = %restore_name, "Restore complete");
        Ok(restore)
    }

    /// Materialize every volume in the snapshot onto the target VM.
    ///
    /// Creates one restored claim per volume backup, staged so that a
    /// failure part-way deletes whatever was already created. Only when
    /// all claims exist is the VM spec repointed and the staging
    /// committed. Returns the per-volume restore records for status.
    pub async fn materialize(
        &self,
        restore: &VirtualMachineRestore,
        vm: &VirtualMachine,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<Vec<VolumeRestore>> {
        let namespace = restore
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        let restore_name = restore.name_any();
        let backups = snapshot.volume_backups();
        if backups.is_empty() {
            return Err(Error::PreconditionNotMet(format!(
                "snapshot '{}' has no volume backups",
                restore.spec.snapshot_name
            )));
        }

        let pvc_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.ctx.client.clone(), &namespace);

        let mut staged: Vec<ScopedObject<PersistentVolumeClaim>> = Vec::new();
        let mut restores: Vec<VolumeRestore> = Vec::new();

        for backup in backups {
            let claim_name = restored_claim_name(&restore_name, &backup.volume_name);
            let pvc = restored_claim(&namespace, &claim_name, &backup.content_handle, backup.size_bytes);

            match pvc_api.create(&PostParams::default(), &pvc).await {
                Ok(_) => {
                    debug!(
                        claim = %claim_name,
                        volume = %backup.volume_name,
                        "Restored claim created"
                    );
                }
                // Re-reconcile of a partially materialized restore
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!(claim = %claim_name, "Restored claim already exists, adopting");
                }
                Err(e) => {
                    release_staged(staged).await;
                    return Err(e.into());
                }
            }

            staged.push(ScopedObject::adopt(pvc_api.clone(), &claim_name));
            restores.push(VolumeRestore {
                volume_name: backup.volume_name.clone(),
                claim_name,
            });
        }

        // Every claim exists; repoint the VM and commit the staging.
        if let Err(e) = self.repoint_vm_volumes(&namespace, vm, &restores).await {
            release_staged(staged).await;
            return Err(e);
        }
        for claim in staged {
            claim.persist();
        }

        info!(
            namespace = %namespace,
            restore = %restore_name,
            volumes = restores.len(),
            "All volumes materialized"
        );
        Ok(restores)
    }

    /// Point the VM's volume references at the restored claims.
    async fn repoint_vm_volumes(
        &self,
        namespace: &str,
        vm: &VirtualMachine,
        restores: &[VolumeRestore],
    ) -> Result<()> {
        let by_volume: BTreeMap<&str, &str> = restores
            .iter()
            .map(|r| (r.volume_name.as_str(), r.claim_name.as_str()))
            .collect();

        let mut volumes = vm.spec.volumes.clone();
        for volume in &mut volumes {
            if let Some(claim) = by_volume.get(volume.name.as_str()) {
                volume.claim_name = (*claim).to_string();
            }
        }

        let patch = serde_json::json!({ "spec": { "volumes": volumes } });
        let api: Api<VirtualMachine> = Api::namespaced(self.ctx.client.clone(), namespace);
        api.patch(
            &vm.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        debug!(vm = %vm.name_any(), "VM volumes repointed at restored claims");
        Ok(())
    }
}

/// Eagerly delete staged claims after a failed materialization, so the
/// cleanup completes inside the reconcile pass instead of on a spawned
/// drop task.
async fn release_staged(staged: Vec<ScopedObject<PersistentVolumeClaim>>) {
    for claim in staged {
        let name = claim.name().to_string();
        if let Err(e) = claim.release().await {
            warn!(claim = %name, error = %e, "Failed to delete staged claim");
        }
    }
}

/// Name of the claim a volume is restored into.
pub fn restored_claim_name(restore_name: &str, volume_name: &str) -> String {
    format!("restore-{}-{}", restore_name, volume_name)
}

/// Build a claim provisioned from frozen snapshot content.
fn restored_claim(
    namespace: &str,
    claim_name: &str,
    content_handle: &str,
    size_bytes: u64,
) -> PersistentVolumeClaim {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        CONTENT_HANDLE_ANNOTATION.to_string(),
        content_handle.to_string(),
    );
    let mut labels = BTreeMap::new();
    labels.insert(
        format!("{}/restored", API_GROUP),
        "true".to_string(),
    );

    let mut requests = BTreeMap::new();
    requests.insert(
        "storage".to_string(),
        Quantity(format_bytes(size_bytes)),
    );

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}
