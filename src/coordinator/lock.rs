//! Kubernetes Lease-based restore locks.
//!
//! Restores against the same VM must run strictly one at a time: a second
//! restore may not start materializing content until the first reaches a
//! terminal phase, or interleaved disk writes could corrupt the target.
//! The lock is a Lease named after the VM whose holder identity is the
//! restore currently materializing. Leases have built-in TTL via
//! `spec.leaseDurationSeconds` and expire on their own if the coordinator
//! crashes mid-restore.

use jiff::Timestamp;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::context::FIELD_MANAGER;
use super::error::Error;
use crate::crd::VirtualMachine;

/// Default lease duration in seconds.
/// If the coordinator crashes, the lock is released after this time.
const LEASE_DURATION_SECONDS: i32 = 300; // 5 minutes

/// Per-VM restore lock backed by a Kubernetes Lease.
pub struct RestoreLock {
    client: Client,
    namespace: String,
    vm_name: String,
}

impl RestoreLock {
    /// Create a new restore lock for a VM.
    pub fn new(client: Client, namespace: &str, vm_name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            vm_name: vm_name.to_string(),
        }
    }

    /// Get the lease name for this VM's restore lock.
    fn lease_name(&self) -> String {
        format!("{}-restore-lock", self.vm_name)
    }

    /// Check if the lease is expired based on renew time and duration.
    fn is_lease_expired(lease: &Lease) -> bool {
        if let Some(spec) = &lease.spec
            && let (Some(renew_time), Some(duration)) =
                (&spec.renew_time, spec.lease_duration_seconds)
        {
            let now = Timestamp::now();
            let elapsed_secs = now.as_second() - renew_time.0.as_second();
            return elapsed_secs > i64::from(duration);
        }
        // No valid spec means expired (or never acquired)
        true
    }

    /// Get the current holder of the lock, if any.
    fn get_holder(lease: &Lease) -> Option<String> {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_ref())
            .cloned()
    }

    /// Acquire the restore lock for the named restore.
    ///
    /// Returns `Ok(())` if the lock was acquired (or already held by this
    /// restore; re-acquire is idempotent and renews the lease).
    /// Returns `Err(OperationLocked)` if another restore holds it.
    pub async fn acquire(&self, restore_name: &str) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease_name = self.lease_name();

        match api.get(&lease_name).await {
            Ok(lease) => {
                if !Self::is_lease_expired(&lease) {
                    let holder = Self::get_holder(&lease).unwrap_or_else(|| "unknown".to_string());
                    if holder == restore_name {
                        debug!(
                            vm = %self.vm_name,
                            restore = %restore_name,
                            "Restore already holds lock, renewing"
                        );
                        return self.renew(restore_name).await;
                    }
                    return Err(Error::OperationLocked {
                        current_holder: holder,
                    });
                }
                debug!(
                    vm = %self.vm_name,
                    restore = %restore_name,
                    "Existing lease expired, acquiring"
                );
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(
                    vm = %self.vm_name,
                    restore = %restore_name,
                    "No existing lease, creating new one"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let now = MicroTime(Timestamp::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(restore_name.to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(1),
                ..Default::default()
            }),
        };

        api.patch(
            &lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&lease),
        )
        .await?;

        info!(
            vm = %self.vm_name,
            restore = %restore_name,
            "Restore lock acquired"
        );

        Ok(())
    }

    /// Acquire the lock with an owner reference to the target VM, so the
    /// lease is garbage collected with the VM.
    pub async fn acquire_with_owner(
        &self,
        restore_name: &str,
        owner: &VirtualMachine,
    ) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease_name = self.lease_name();

        match api.get(&lease_name).await {
            Ok(lease) => {
                if !Self::is_lease_expired(&lease) {
                    let holder = Self::get_holder(&lease).unwrap_or_else(|| "unknown".to_string());
                    if holder == restore_name {
                        return self.renew(restore_name).await;
                    }
                    return Err(Error::OperationLocked {
                        current_holder: holder,
                    });
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let owner_ref = OwnerReference {
            api_version: VirtualMachine::api_version(&()).into_owned(),
            kind: VirtualMachine::kind(&()).into_owned(),
            name: owner.name_any(),
            uid: owner.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };

        let now = MicroTime(Timestamp::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![owner_ref]),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(restore_name.to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(1),
                ..Default::default()
            }),
        };

        api.patch(
            &lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&lease),
        )
        .await?;

        info!(
            vm = %self.vm_name,
            restore = %restore_name,
            "Restore lock acquired with owner reference"
        );

        Ok(())
    }

    /// Renew the lease (call periodically during long restores).
    pub async fn renew(&self, restore_name: &str) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease_name = self.lease_name();

        // Verify we still hold the lock before renewing
        match api.get(&lease_name).await {
            Ok(lease) => {
                let holder = Self::get_holder(&lease);
                if holder.as_deref() != Some(restore_name) {
                    warn!(
                        vm = %self.vm_name,
                        restore = %restore_name,
                        current_holder = ?holder,
                        "Cannot renew lease - not the current holder"
                    );
                    return Err(Error::OperationLocked {
                        current_holder: holder.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }

        let now = MicroTime(Timestamp::now());
        let patch = serde_json::json!({
            "spec": {
                "renewTime": now,
            }
        });

        api.patch(
            &lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        debug!(vm = %self.vm_name, restore = %restore_name, "Restore lock renewed");

        Ok(())
    }

    /// Release the lock.
    ///
    /// Only releases if the named restore is the current holder; releasing
    /// a lock we no longer hold is a no-op.
    pub async fn release(&self, restore_name: &str) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease_name = self.lease_name();

        match api.get(&lease_name).await {
            Ok(lease) => {
                let holder = Self::get_holder(&lease);
                if holder.as_deref() != Some(restore_name) {
                    warn!(
                        vm = %self.vm_name,
                        restore = %restore_name,
                        current_holder = ?holder,
                        "Cannot release lease - not the current holder"
                    );
                    return Ok(());
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                // Already deleted
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        api.delete(&lease_name, &DeleteParams::default()).await?;

        info!(vm = %self.vm_name, restore = %restore_name, "Restore lock released");

        Ok(())
    }
}
