//! vm-storage-coordinator library crate
//!
//! This module exports the coordinator components, CRD definitions, guest
//! channel, health server and admission webhooks.

pub mod coordinator;
pub mod crd;
pub mod guest;
pub mod health;
pub mod webhooks;

pub use coordinator::{Context, Error, ResizeWatcher, RestoreOrchestrator, SnapshotManager};
pub use health::HealthState;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, PredicateConfig, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use coordinator::reconciler::{error_policy, reconcile};
use crd::{VirtualMachine, VirtualMachineRestore};
use guest::GuestExec;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all controllers.
///
/// This ensures consistent behavior across all controllers:
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation, PredicateConfig::default());
    (reader, stream)
}

/// Run the restore coordinator (cluster-wide).
///
/// Watches VirtualMachineRestore resources and reconciles them. Target VM
/// changes are mapped back to the restores pointed at them, so a parked
/// restore wakes up as soon as its VM stops.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_coordinator(
    client: Client,
    guest: Arc<dyn GuestExec>,
    health_state: Option<Arc<HealthState>>,
) {
    run_coordinator_scoped(client, guest, health_state, None).await
}

/// Run the restore coordinator with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
///
/// Use the scoped version for integration tests to enable parallel test execution.
pub async fn run_coordinator_scoped(
    client: Client,
    guest: Arc<dyn GuestExec>,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!(
        "Starting coordinator for VirtualMachineRestore resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), guest, health_state));

    let restores: Api<VirtualMachineRestore> = scoped_api(client.clone(), namespace);
    let vms: Api<VirtualMachine> = scoped_api(client.clone(), namespace);

    let watcher_config = default_watcher_config();

    // Create filtered stream with standard optimizations (reflector, backoff, generation predicate)
    let (reader, restore_stream) = create_filtered_stream(restores, watcher_config.clone());

    // A VM status change (running -> stopped) must wake every restore
    // parked against that VM. The reflector store maps a VM back to the
    // restores targeting it.
    let vm_mapper = {
        let reader = reader.clone();
        move |vm: VirtualMachine| {
            let vm_name = vm.name_any();
            let vm_namespace = vm.namespace();
            reader
                .state()
                .into_iter()
                .filter(move |restore| {
                    restore.spec.target_name == vm_name && restore.namespace() == vm_namespace
                })
                .map(|restore| ObjectRef::from_obj(restore.as_ref()))
                .collect::<Vec<_>>()
        }
    };

    // Create and run the controller using for_stream with the pre-filtered stream
    Controller::for_stream(restore_stream, reader.clone())
        .watches(vms, watcher_config, vm_mapper)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // ObjectNotFound/NotFound errors are expected after deletion when
                    // related watch events trigger reconciliation for a deleted object.
                    // Log these at debug level instead of error.
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    error!("Controller stream ended unexpectedly");
}
