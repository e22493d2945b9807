//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for per-object metrics (namespace + name)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ObjectLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for phase-based metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for wait-outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabels {
    pub outcome: String,
}

impl EncodeLabelSet for OutcomeLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the coordinator
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ObjectLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ObjectLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ObjectLabels, Histogram>,
    /// Accepted claim expansions
    pub expansions_total: Family<ObjectLabels, Counter>,
    /// Resize waits by outcome (acknowledged / timeout)
    pub resize_awaits_total: Family<OutcomeLabels, Counter>,
    /// Snapshots requested per namespace
    pub snapshots_created_total: Family<ObjectLabels, Counter>,
    /// Restores by phase
    pub restores_total: Family<PhaseLabels, Gauge>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "vmcoord_reconciliations",
            "Total number of restore reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "vmcoord_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ObjectLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "vmcoord_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let expansions_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "vmcoord_expansions",
            "Total number of accepted claim expansions",
            expansions_total.clone(),
        );

        let resize_awaits_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "vmcoord_resize_awaits",
            "Resize waits by outcome",
            resize_awaits_total.clone(),
        );

        let snapshots_created_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "vmcoord_snapshots_created",
            "Total number of snapshots requested",
            snapshots_created_total.clone(),
        );

        let restores_total = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "vmcoord_restores_total",
            "Number of VirtualMachineRestore resources by phase",
            restores_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            expansions_total,
            resize_awaits_total,
            snapshots_created_total,
            restores_total,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ObjectLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        let labels = ObjectLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record an accepted claim expansion
    pub fn record_expansion(&self, namespace: &str, claim: &str) {
        let labels = ObjectLabels {
            namespace: namespace.to_string(),
            name: claim.to_string(),
        };
        self.expansions_total.get_or_create(&labels).inc();
    }

    /// Record the outcome of a resize wait
    pub fn record_resize_await(&self, acknowledged: bool) {
        let labels = OutcomeLabels {
            outcome: if acknowledged {
                "acknowledged".to_string()
            } else {
                "timeout".to_string()
            },
        };
        self.resize_awaits_total.get_or_create(&labels).inc();
    }

    /// Record a requested snapshot
    pub fn record_snapshot_created(&self, namespace: &str) {
        let labels = ObjectLabels {
            namespace: namespace.to_string(),
            name: String::new(),
        };
        self.snapshots_created_total.get_or_create(&labels).inc();
    }

    /// Update restore count by phase
    pub fn set_restores_by_phase(&self, phase: &str, count: i64) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.restores_total.get_or_create(&labels).set(count);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the coordinator is ready (acquired leadership and running controller)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp (Unix epoch seconds)
    last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the coordinator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the coordinator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Record the wall-clock time of a completed reconcile.
    pub fn mark_reconciled(&self) {
        let now = jiff::Timestamp::now().as_second().max(0) as u64;
        self.last_reconcile.store(now, Ordering::Relaxed);
    }

    /// Unix epoch seconds of the last completed reconcile, 0 if none yet.
    pub fn last_reconcile_epoch(&self) -> u64 {
        self.last_reconcile.load(Ordering::Relaxed)
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the coordinator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(port = 8080, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
