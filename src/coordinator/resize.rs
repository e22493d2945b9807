//! Resize Watcher: online claim expansion and in-guest resize tracking.
//!
//! Expansion happens in two halves. The control-plane half bumps the
//! claim's requested size with exact byte arithmetic, using compare-and-set
//! against the observed resourceVersion so concurrent expands of sibling
//! claims can never produce a lost update. The guest half counts the block
//! device resize acknowledgments in the guest kernel log; `await_resize`
//! polls that count until the expected increment lands.
//!
//! The acknowledgment channel is at-least-once: a prior expansion's
//! acknowledgment can arrive while a later one is being awaited, so the
//! watcher accepts exactly `target` or `target + 1`. Nothing narrower
//! (flaky waits) and nothing wider (a hidden double resize is a bug worth
//! surfacing as a timeout with diagnostics).

use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, Patch, PatchParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capacity::{format_bytes, grow_delta, parse_quantity};
use super::context::Context;
use super::error::{Error, Result};
use super::poll::{WaitResult, poll_until};
use crate::guest::{GuestExec, GuestRef, kernel_log, resize_event_count};

/// Default guest poll cadence while awaiting a resize.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default budget for a resize to be acknowledged in the guest.
const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(240);

/// Bounded retries for compare-and-set conflicts on the claim.
const DEFAULT_CAS_ATTEMPTS: u32 = 5;

/// Lifetime of the in-guest resize counter.
///
/// The counter is read from the guest kernel log, which restarts with each
/// guest boot. Whether a platform preserves it across instance recreation
/// is storage-stack dependent, so it is an explicit parameter rather than
/// an assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeCounterScope {
    /// Counter restarts at zero with each new VirtualMachineInstance.
    /// Baselines must be captured after the instance of interest is up.
    #[default]
    InstanceLifetime,
    /// Counter persists across instance recreation of the same VM.
    VmLifetime,
}

/// Tunables for the resize watcher.
#[derive(Debug, Clone)]
pub struct ResizeWatcherConfig {
    pub poll_interval: Duration,
    pub await_timeout: Duration,
    pub cas_attempts: u32,
    pub counter_scope: ResizeCounterScope,
}

impl Default for ResizeWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
            cas_attempts: DEFAULT_CAS_ATTEMPTS,
            counter_scope: ResizeCounterScope::default(),
        }
    }
}

/// Result of an accepted expand request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandOutcome {
    /// Claim size before the expand, exact bytes.
    pub previous_bytes: u64,
    /// Claim size now requested, exact bytes.
    pub new_bytes: u64,
}

/// Resize counter reading taken before issuing expands, so a later await
/// can measure the increment. Valid for one counter scope (one guest boot
/// under `InstanceLifetime`).
#[derive(Debug, Clone, Copy)]
pub struct ResizeBaseline {
    pub count: u64,
}

/// Watches claim expansion end to end: control-plane size bump plus
/// in-guest acknowledgment.
pub struct ResizeWatcher {
    ctx: Context,
    config: ResizeWatcherConfig,
}

impl ResizeWatcher {
    pub fn new(ctx: Context) -> Self {
        Self::with_config(ctx, ResizeWatcherConfig::default())
    }

    pub fn with_config(ctx: Context, config: ResizeWatcherConfig) -> Self {
        Self { ctx, config }
    }

    /// Counter scope this watcher was configured with.
    pub fn counter_scope(&self) -> ResizeCounterScope {
        self.config.counter_scope
    }

    /// Grow a claim by `delta_bytes`. Reads the current requested size,
    /// adds the delta in exact bytes and writes the sum back with a
    /// compare-and-set patch. Conflicts re-read and retry, so concurrent
    /// expands of sibling claims serialize instead of clobbering.
    pub async fn request_expand(
        &self,
        namespace: &str,
        claim_name: &str,
        delta_bytes: u64,
    ) -> Result<ExpandOutcome> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.ctx.client.clone(), namespace);

        let mut last_err: Option<Error> = None;
        for attempt in 0..self.config.cas_attempts {
            let pvc = api.get(claim_name).await?;
            let current_str = requested_storage(&pvc)?;
            let previous_bytes = parse_quantity(&current_str)?;
            let new_bytes = previous_bytes
                .checked_add(delta_bytes)
                .ok_or(super::capacity::CapacityError::AddOverflow(
                    previous_bytes,
                    delta_bytes,
                ))?;

            let resource_version = pvc
                .metadata
                .resource_version
                .clone()
                .ok_or_else(|| Error::MissingField("metadata.resourceVersion".to_string()))?;

            // Carrying the observed resourceVersion turns the merge patch
            // into a compare-and-set: a concurrent writer gets us a 409.
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": resource_version },
                "spec": {
                    "resources": {
                        "requests": { "storage": format_bytes(new_bytes) }
                    }
                }
            });

            match api
                .patch(claim_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {
                    info!(
                        namespace = %namespace,
                        claim = %claim_name,
                        previous = previous_bytes,
                        new = new_bytes,
                        "Claim expansion requested"
                    );
                    if let Some(state) = &self.ctx.health_state {
                        state.metrics.record_expansion(namespace, claim_name);
                    }
                    return Ok(ExpandOutcome {
                        previous_bytes,
                        new_bytes,
                    });
                }
                Err(e) => {
                    let err: Error = e.into();
                    if err.is_conflict() {
                        debug!(
                            claim = %claim_name,
                            attempt = attempt + 1,
                            "Claim changed underneath us, re-reading"
                        );
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        warn!(
            claim = %claim_name,
            attempts = self.config.cas_attempts,
            "Claim expansion kept conflicting"
        );
        Err(last_err.unwrap_or_else(|| Error::PreconditionNotMet(
            format!("claim '{}' kept changing during expand", claim_name),
        )))
    }

    /// Resize a claim to an absolute byte size. Shrinks are rejected
    /// before any API write: claim sizes only ever grow.
    pub async fn request_resize_to(
        &self,
        namespace: &str,
        claim_name: &str,
        requested_bytes: u64,
    ) -> Result<ExpandOutcome> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.ctx.client.clone(), namespace);
        let pvc = api.get(claim_name).await?;
        let current_bytes = parse_quantity(&requested_storage(&pvc)?)?;
        let delta = grow_delta(current_bytes, requested_bytes)?;

        self.request_expand(namespace, claim_name, delta).await
    }

    /// Read the guest's resize acknowledgment count.
    ///
    /// Monotonic non-decreasing for the lifetime declared by
    /// `counter_scope`.
    pub async fn observe_resize_count(&self, guest: &GuestRef) -> Result<u64> {
        Ok(resize_event_count(self.ctx.guest.as_ref(), guest).await?)
    }

    /// Capture the counter before issuing expands so the increments can be
    /// awaited afterwards.
    pub async fn baseline(&self, guest: &GuestRef) -> Result<ResizeBaseline> {
        let count = self.observe_resize_count(guest).await?;
        Ok(ResizeBaseline { count })
    }

    /// Wait until the guest has acknowledged `expected_increment` resizes
    /// beyond `baseline` (aggregate across simultaneously expanded claims).
    ///
    /// Accepts `baseline + expected` or one extra (late acknowledgment of
    /// an earlier resize). On timeout the error carries the last observed
    /// count and a kernel log snapshot for postmortem.
    pub async fn await_resize(
        &self,
        guest: &GuestRef,
        baseline: ResizeBaseline,
        expected_increment: u64,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<WaitResult<u64>> {
        let timeout = timeout.unwrap_or(self.config.await_timeout);
        let cancel = cancel.unwrap_or_default();

        let result = await_resize_count(
            self.ctx.guest.as_ref(),
            guest,
            baseline,
            expected_increment,
            self.config.poll_interval,
            timeout,
            &cancel,
        )
        .await;

        match &result {
            Ok(reached) => {
                if let Some(state) = &self.ctx.health_state {
                    state.metrics.record_resize_await(true);
                }
                info!(
                    guest = %guest,
                    observed = reached.last_observed,
                    elapsed = ?reached.elapsed,
                    "Resize acknowledged by guest"
                );
            }
            Err(Error::ResizeTimeout {
                expected,
                last_observed,
                ..
            }) => {
                if let Some(state) = &self.ctx.health_state {
                    state.metrics.record_resize_await(false);
                }
                warn!(
                    guest = %guest,
                    target = expected,
                    last_observed = last_observed,
                    "Resize count never reached target"
                );
            }
            Err(_) => {}
        }

        result
    }
}

/// Wait until a guest has acknowledged `expected_increment` resizes beyond
/// `baseline`, polling over any guest channel. On timeout the error carries
/// the last observed count and a kernel log snapshot for postmortem.
pub async fn await_resize_count(
    exec: &dyn GuestExec,
    guest: &GuestRef,
    baseline: ResizeBaseline,
    expected_increment: u64,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<WaitResult<u64>> {
    let target = baseline.count + expected_increment;

    debug!(
        guest = %guest,
        baseline = baseline.count,
        target = target,
        "Awaiting in-guest resize acknowledgments"
    );

    let result = poll_until(
        poll_interval,
        timeout,
        cancel,
        || async { resize_event_count(exec, guest).await.map_err(Error::from) },
        |count| within_tolerance(baseline.count, expected_increment, *count),
    )
    .await?;

    if result.reached_target {
        return Ok(result);
    }

    // Timeout postmortems need the guest's view, not just a number.
    let diagnostics = kernel_log(exec, guest)
        .await
        .unwrap_or_else(|e| format!("<kernel log unavailable: {}>", e));
    Err(Error::ResizeTimeout {
        expected: target,
        last_observed: result.last_observed,
        timeout,
        diagnostics,
    })
}

/// Whether an observed count satisfies a resize await.
///
/// Accepts exactly the target (`baseline + expected`) or one extra, the
/// late acknowledgment of a previous resize. Anything below is not done
/// yet, anything above means resizes this wait never issued.
pub fn within_tolerance(baseline: u64, expected_increment: u64, observed: u64) -> bool {
    let target = baseline + expected_increment;
    observed == target || observed == target + 1
}

/// The claim's currently requested storage quantity.
fn requested_storage(pvc: &PersistentVolumeClaim) -> Result<String> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .map(|Quantity(q)| q.clone())
        .ok_or_else(|| Error::MissingField("spec.resources.requests.storage".to_string()))
}
