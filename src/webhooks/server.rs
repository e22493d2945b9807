//! Admission webhook server.
//!
//! Provides HTTP endpoints for Kubernetes admission webhooks.
//!
//! To enable webhooks:
//! 1. Deploy cert-manager for TLS certificates
//! 2. Create a ValidatingWebhookConfiguration for VolumeClone
//! 3. Mount the TLS certificate secret to the coordinator pod at /etc/webhook/certs/
//!
//! The webhook server starts automatically when certificates are present.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::Api;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::{Client, Resource};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::crd::VolumeClone;
use crate::webhooks::policies::{ValidationContext, validate_all};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;

/// Shared state for webhook handlers
pub struct WebhookState {
    pub client: Client,
}

impl WebhookState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Create a denial response with reason embedded in message.
/// kube-rs deny() only sets status.message, so we format as "[reason] message"
fn deny_with_reason<T: Resource<DynamicType = ()>>(
    request: &AdmissionRequest<T>,
    message: &str,
    reason: &str,
) -> AdmissionReview<kube::core::DynamicObject> {
    let full_message = format!("[{}] {}", reason, message);
    AdmissionResponse::from(request)
        .deny(full_message)
        .into_review()
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate-volumeclone", post(validate_volume_clone))
        .with_state(state)
}

/// Outcome of resolving the source claim's live size.
///
/// A claim that genuinely does not exist and a claim whose size could not
/// be determined are denied with different reasons: one is the user's
/// mistake, the other is ours (or the API server's).
#[derive(Debug)]
enum SourceLookup {
    /// Claim exists and has a storage request.
    Found(String),
    /// Claim does not exist.
    Absent,
    /// Size could not be determined (API failure or malformed claim).
    Unavailable(String),
}

/// Classify the API server's answer about the source claim.
fn classify_source_lookup(
    result: std::result::Result<PersistentVolumeClaim, kube::Error>,
) -> SourceLookup {
    match result {
        Ok(pvc) => match pvc
            .spec
            .and_then(|s| s.resources)
            .and_then(|r| r.requests)
            .and_then(|mut requests| requests.remove("storage"))
        {
            Some(Quantity(q)) => SourceLookup::Found(q),
            None => SourceLookup::Unavailable("claim has no storage request".to_string()),
        },
        Err(kube::Error::Api(e)) if e.code == 404 => SourceLookup::Absent,
        Err(e) => SourceLookup::Unavailable(e.to_string()),
    }
}

/// Resolve the source claim's currently requested size.
async fn source_claim_size(client: &Client, namespace: &str, claim_name: &str) -> SourceLookup {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    classify_source_lookup(api.get(claim_name).await)
}

/// Validate a VolumeClone admission webhook handler
async fn validate_volume_clone(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<VolumeClone>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<VolumeClone> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    let uid = &request.uid;
    debug!(
        uid = %uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    // DELETE operations are always allowed
    if request.operation == Operation::Delete {
        info!(uid = %uid, "Admission request allowed (DELETE)");
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    }

    let clone: VolumeClone = match &request.object {
        Some(obj) => obj.clone(),
        None => {
            error!(uid = %uid, "Missing object in request");
            return (
                StatusCode::OK,
                Json(deny_with_reason(
                    &request,
                    "Missing object in request",
                    "InvalidRequest",
                )),
            );
        }
    };

    let old_clone: Option<VolumeClone> = request.old_object.clone();

    // The size floor is the source claim's LIVE size, so it must be read at
    // admission time, not taken from the request.
    let namespace = request.namespace.as_deref().unwrap_or("default");
    let source_size =
        match source_claim_size(&state.client, namespace, &clone.spec.source_claim_name).await {
            SourceLookup::Found(size) => Some(size),
            SourceLookup::Absent => None,
            SourceLookup::Unavailable(detail) => {
                error!(
                    uid = %uid,
                    claim = %clone.spec.source_claim_name,
                    detail = %detail,
                    "Could not verify source claim size"
                );
                return (
                    StatusCode::OK,
                    Json(deny_with_reason(
                        &request,
                        &format!(
                            "could not verify source claim '{}': {}",
                            clone.spec.source_claim_name, detail
                        ),
                        "SourceUnavailable",
                    )),
                );
            }
        };

    let ctx = ValidationContext {
        clone: &clone,
        old_clone: old_clone.as_ref(),
        source_size: source_size.as_deref(),
        dry_run: request.dry_run,
        namespace: request.namespace.as_deref(),
    };

    // Run tiered validation policies
    let result = validate_all(&ctx);

    if !result.allowed {
        let reason = result
            .reason
            .unwrap_or_else(|| "ValidationFailed".to_string());
        let message = result
            .message
            .unwrap_or_else(|| "Validation failed".to_string());
        warn!(uid = %uid, reason = %reason, message = %message, "Admission request denied");
        return (
            StatusCode::OK,
            Json(deny_with_reason(&request, &message, &reason)),
        );
    }

    info!(uid = %uid, "Admission request allowed");
    (
        StatusCode::OK,
        Json(AdmissionResponse::from(&request).into_review()),
    )
}

/// Errors that can occur when running the webhook server
#[derive(Debug)]
pub enum WebhookError {
    /// TLS configuration error
    TlsConfig(String),
    /// Server error
    Server(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::TlsConfig(msg) => write!(f, "TLS configuration error: {}", msg),
            WebhookError::Server(msg) => write!(f, "Webhook server error: {}", msg),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:9443 and serves the /validate-volumeclone endpoint.
/// TLS certificates are loaded from the paths specified.
pub async fn run_webhook_server(
    client: Client,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let state = Arc::new(WebhookState::new(client));
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use kube::core::Status;
    use kube::core::response::StatusSummary;
    use std::collections::BTreeMap;

    fn pvc_with_storage(size: &str) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(size.to_string()));
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(Box::new(Status {
            status: Some(StatusSummary::Failure),
            message: format!("{} ({})", reason, code),
            reason: reason.to_string(),
            code,
            details: None,
            metadata: Default::default(),
        }))
    }

    #[test]
    fn test_source_lookup_found() {
        let lookup = classify_source_lookup(Ok(pvc_with_storage("20Gi")));
        assert!(matches!(lookup, SourceLookup::Found(size) if size == "20Gi"));
    }

    #[test]
    fn test_source_lookup_absent_on_404() {
        let lookup = classify_source_lookup(Err(api_error(404, "NotFound")));
        assert!(matches!(lookup, SourceLookup::Absent));
    }

    #[test]
    fn test_source_lookup_unavailable_on_api_failure() {
        // A transient server error is not "claim does not exist"
        let lookup = classify_source_lookup(Err(api_error(500, "InternalError")));
        assert!(matches!(lookup, SourceLookup::Unavailable(_)));
    }

    #[test]
    fn test_source_lookup_unavailable_without_storage_request() {
        let lookup = classify_source_lookup(Ok(PersistentVolumeClaim::default()));
        assert!(matches!(lookup, SourceLookup::Unavailable(_)));
    }
}
