//! Clone admission policy scenarios.
//!
//! The size floor is enforced against the source claim's live size at
//! admission time; spec fields are immutable once persisted.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use vm_storage_coordinator::crd::{VolumeClone, VolumeCloneSpec};
use vm_storage_coordinator::webhooks::policies::{ValidationContext, validate_all};

fn clone_request(source: &str, size: &str) -> VolumeClone {
    VolumeClone {
        metadata: ObjectMeta {
            name: Some("clone-1".to_string()),
            namespace: Some("storage-tests".to_string()),
            ..Default::default()
        },
        spec: VolumeCloneSpec {
            source_claim_name: source.to_string(),
            size: size.to_string(),
        },
        status: None,
    }
}

fn admission<'a>(
    clone: &'a VolumeClone,
    old: Option<&'a VolumeClone>,
    source_size: Option<&'a str>,
) -> ValidationContext<'a> {
    ValidationContext {
        clone,
        old_clone: old,
        source_size,
        dry_run: false,
        namespace: Some("storage-tests"),
    }
}

#[test]
fn test_create_at_source_size_allowed() {
    let clone = clone_request("source-claim", "20Gi");
    let result = validate_all(&admission(&clone, None, Some("20Gi")));
    assert!(result.allowed);
}

#[test]
fn test_create_above_source_size_allowed() {
    let clone = clone_request("source-claim", "25Gi");
    let result = validate_all(&admission(&clone, None, Some("20Gi")));
    assert!(result.allowed);
}

#[test]
fn test_create_below_source_size_denied_synchronously() {
    let clone = clone_request("source-claim", "20Gi");
    let result = validate_all(&admission(&clone, None, Some("21Gi")));
    assert!(!result.allowed);
    assert_eq!(result.reason.as_deref(), Some("CloneSizeTooSmall"));
    assert!(
        result
            .message
            .as_deref()
            .unwrap()
            .contains("smaller than the source")
    );
}

#[test]
fn test_floor_is_live_size_not_creation_size() {
    // Source created at 20Gi, then expanded by exactly 1Gi. Its live size
    // is the plain byte count the expansion wrote back.
    let live = (21u64 << 30).to_string();

    let at_creation_size = clone_request("source-claim", "20Gi");
    assert!(!validate_all(&admission(&at_creation_size, None, Some(&live))).allowed);

    let at_live_size = clone_request("source-claim", "21Gi");
    assert!(validate_all(&admission(&at_live_size, None, Some(&live))).allowed);
}

#[test]
fn test_missing_source_denied() {
    let clone = clone_request("absent-claim", "20Gi");
    let result = validate_all(&admission(&clone, None, None));
    assert!(!result.allowed);
    assert_eq!(result.reason.as_deref(), Some("SourceNotFound"));
}

#[test]
fn test_update_cannot_change_spec() {
    let old = clone_request("source-claim", "20Gi");

    let resized = clone_request("source-claim", "30Gi");
    let result = validate_all(&admission(&resized, Some(&old), Some("20Gi")));
    assert!(!result.allowed);
    assert_eq!(result.reason.as_deref(), Some("ImmutableField"));

    let repointed = clone_request("other-claim", "20Gi");
    let result = validate_all(&admission(&repointed, Some(&old), Some("20Gi")));
    assert!(!result.allowed);
}

#[test]
fn test_update_without_spec_change_allowed() {
    let old = clone_request("source-claim", "20Gi");
    let new = clone_request("source-claim", "20Gi");
    let result = validate_all(&admission(&new, Some(&old), Some("20Gi")));
    assert!(result.allowed);
}

#[test]
fn test_size_floor_checked_before_immutability() {
    // Tier 1 runs first: an update that keeps the spec but whose source
    // grew past it is denied on size, not allowed by immutability.
    let old = clone_request("source-claim", "20Gi");
    let new = clone_request("source-claim", "20Gi");
    let live = (21u64 << 30).to_string();
    let result = validate_all(&admission(&new, Some(&old), Some(&live)));
    assert!(!result.allowed);
    assert_eq!(result.reason.as_deref(), Some("CloneSizeTooSmall"));
}
