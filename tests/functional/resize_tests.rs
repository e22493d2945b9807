//! Resize wait behavior against a mock guest.
//!
//! Drives `await_resize_count` end to end: a wait for N resizes beyond a
//! baseline accepts exactly N or N+1 acknowledgments, counts are aggregate
//! across simultaneously expanded disks, and a count that never lands in
//! the band times out carrying the last observation plus a kernel log
//! snapshot.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vm_storage_coordinator::coordinator::{
    Error, ResizeBaseline, WaitResult, await_resize_count, within_tolerance,
};
use vm_storage_coordinator::guest::{GuestError, GuestRef, kernel_log, resize_event_count};

use crate::mock_guest::MockGuest;

const INTERVAL: Duration = Duration::from_secs(5);
const TIMEOUT: Duration = Duration::from_secs(60);

fn guest_ref() -> GuestRef {
    GuestRef::new("storage-tests", "rhel-guest")
}

async fn await_band(
    guest: &MockGuest,
    baseline: u64,
    expected: u64,
) -> Result<WaitResult<u64>, Error> {
    let cancel = CancellationToken::new();
    await_resize_count(
        guest,
        &guest_ref(),
        ResizeBaseline { count: baseline },
        expected,
        INTERVAL,
        TIMEOUT,
        &cancel,
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn test_await_accepts_exact_target() {
    let guest = MockGuest::new();

    // Guest acknowledges both resizes a little later
    let remote = guest.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        remote.acknowledge_resize();
        remote.acknowledge_resize();
    });

    let result = await_band(&guest, 0, 2).await.unwrap();
    assert!(result.reached_target);
    assert_eq!(result.last_observed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_await_accepts_one_extra_acknowledgment() {
    // A late acknowledgment of an earlier resize can arrive during the
    // wait: expected 2, observed 3 is still a success.
    let guest = MockGuest::with_resize_count(3);
    let result = await_band(&guest, 0, 2).await.unwrap();
    assert!(result.reached_target);
    assert_eq!(result.last_observed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_overshoot_beyond_band_times_out() {
    // Two extra acknowledgments means resizes this wait never issued; the
    // band must not swallow that.
    let guest = MockGuest::with_resize_count(4);
    let err = await_band(&guest, 0, 2).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ResizeTimeout {
            expected: 2,
            last_observed: 4,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_missing_acknowledgment_times_out_with_diagnostics() {
    let guest = MockGuest::with_resize_count(1);
    let err = await_band(&guest, 0, 2).await.unwrap_err();
    match err {
        Error::ResizeTimeout {
            expected,
            last_observed,
            timeout,
            diagnostics,
        } => {
            assert_eq!(expected, 2);
            assert_eq!(last_observed, 1);
            assert_eq!(timeout, TIMEOUT);
            // Postmortem payload is the guest's kernel log, one resize line
            assert_eq!(diagnostics.matches("new size").count(), 1);
        }
        other => panic!("expected ResizeTimeout, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_counts_are_aggregate_across_disks() {
    // Two prior resizes on the baseline, then three disks expanded at
    // once: the wait targets baseline + 3 regardless of which disk each
    // acknowledgment belongs to.
    let guest = MockGuest::with_resize_count(2);

    let remote = guest.clone();
    tokio::spawn(async move {
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(7)).await;
            remote.acknowledge_resize();
        }
    });

    let result = await_band(&guest, 2, 3).await.unwrap();
    assert!(result.reached_target);
    assert_eq!(result.last_observed, 5);
}

#[tokio::test]
async fn test_unreachable_guest_propagates_retryable_error() {
    let guest = MockGuest::new();
    guest.set_unreachable(true);

    let err = resize_event_count(&guest, &guest_ref()).await.unwrap_err();
    assert!(matches!(err, GuestError::Unreachable { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_kernel_log_reflects_acknowledged_resizes() {
    let guest = MockGuest::with_resize_count(3);
    let log = kernel_log(&guest, &guest_ref()).await.unwrap();
    assert_eq!(log.matches("new size").count(), 3);
}

#[test]
fn test_tolerance_band_boundaries() {
    // baseline 2, expected 3: accepted set is exactly {5, 6}
    assert!(!within_tolerance(2, 3, 4));
    assert!(within_tolerance(2, 3, 5));
    assert!(within_tolerance(2, 3, 6));
    assert!(!within_tolerance(2, 3, 7));

    // zero expected still accepts one stray acknowledgment
    assert!(within_tolerance(4, 0, 4));
    assert!(within_tolerance(4, 0, 5));
    assert!(!within_tolerance(4, 0, 3));
}
