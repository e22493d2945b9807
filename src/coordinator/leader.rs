//! Lease-based leader election.
//!
//! Only one coordinator replica may drive restores and expansions at a
//! time. Election uses a single namespaced Lease: whichever replica writes
//! its identity as holder leads until it stops renewing. The arithmetic
//! mirrors the restore lock; the difference is that the holder is a pod,
//! not a restore, and losing the lease is fatal for the process.

use jiff::Timestamp;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info, warn};

use super::context::FIELD_MANAGER;
use super::error::Error;

/// Name of the coordinator's leader lease.
pub const LEASE_NAME: &str = "vm-storage-coordinator-leader";

/// Leader lease duration in seconds. A crashed leader is replaced after
/// this long.
const LEASE_DURATION_SECONDS: i32 = 15;

/// Outcome of one election attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// This replica holds the lease.
    Leading,
    /// Another replica holds an unexpired lease.
    Following,
}

/// Single-lease leader elector.
pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Renewal cadence leaders should use.
    pub fn renew_interval() -> std::time::Duration {
        std::time::Duration::from_secs(i64::from(LEASE_DURATION_SECONDS) as u64 / 3)
    }

    fn is_expired(lease: &Lease) -> bool {
        if let Some(spec) = &lease.spec
            && let (Some(renew_time), Some(duration)) =
                (&spec.renew_time, spec.lease_duration_seconds)
        {
            let elapsed = Timestamp::now().as_second() - renew_time.0.as_second();
            return elapsed > i64::from(duration);
        }
        true
    }

    /// Try to take or renew the lease. Idempotent for the current holder.
    pub async fn try_acquire(&self) -> Result<LeaseState, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        match api.get(LEASE_NAME).await {
            Ok(lease) => {
                let holder = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.clone());
                if holder.as_deref() == Some(self.identity.as_str()) {
                    return self.write_lease(&api, false).await;
                }
                if !Self::is_expired(&lease) {
                    debug!(holder = ?holder, "Leader lease held elsewhere");
                    return Ok(LeaseState::Following);
                }
                info!(previous = ?holder, "Leader lease expired, taking over");
                self.write_lease(&api, true).await
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!(identity = %self.identity, "No leader lease, creating");
                self.write_lease(&api, true).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew the lease; returns `Following` if leadership was lost.
    pub async fn renew(&self) -> Result<LeaseState, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(LEASE_NAME).await {
            Ok(lease) => {
                let holder = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.clone());
                if holder.as_deref() != Some(self.identity.as_str()) {
                    warn!(holder = ?holder, "Leadership lost");
                    return Ok(LeaseState::Following);
                }
                self.write_lease(&api, false).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_lease(&self, api: &Api<Lease>, transition: bool) -> Result<LeaseState, Error> {
        let now = MicroTime(Timestamp::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: transition.then(|| now.clone()),
                renew_time: Some(now),
                ..Default::default()
            }),
        };
        api.patch(
            LEASE_NAME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&lease),
        )
        .await?;
        Ok(LeaseState::Leading)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_without_spec() {
        let lease = Lease {
            metadata: ObjectMeta::default(),
            spec: None,
        };
        assert!(LeaderElector::is_expired(&lease));
    }

    #[test]
    fn test_fresh_lease_not_expired() {
        let lease = Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: Some("pod-a".to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                renew_time: Some(MicroTime(Timestamp::now())),
                ..Default::default()
            }),
        };
        assert!(!LeaderElector::is_expired(&lease));
    }

    #[test]
    fn test_renew_interval_shorter_than_duration() {
        assert!(
            LeaderElector::renew_interval()
                < std::time::Duration::from_secs(i64::from(LEASE_DURATION_SECONDS) as u64)
        );
    }
}
