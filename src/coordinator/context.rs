//! Shared context for the coordinator.
//!
//! Every component receives its collaborators through this struct: the
//! Kubernetes client, the guest command channel, the event recorder
//! identity and optional health state. No process-wide singletons.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::guest::GuestExec;
use crate::health::HealthState;

/// Field manager name for the coordinator
pub const FIELD_MANAGER: &str = "vm-storage-coordinator";

/// Shared context for coordinator components
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Guest command channel
    pub guest: Arc<dyn GuestExec>,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        guest: Arc<dyn GuestExec>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            guest,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish<K>(
        &self,
        resource: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
