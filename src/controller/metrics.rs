//! Prometheus metrics for the VPA operator
//!
//! Metrics follow the RED convention: rate via counters, errors via the
//! `result` label (with an `error_type` classification), duration via
//! histograms. All writes go through the recorder functions here so label
//! handling lives in one place.
//!
//! # Exported metrics
//! - `vpa_operator_reconcile_total{vpamanager,result,error_type}` (counter)
//! - `vpa_operator_reconcile_duration_seconds{vpamanager,result}` (histogram)
//! - `vpa_operator_managed_vpas{vpamanager}` (gauge)
//! - `vpa_operator_watched_deployments{vpamanager}` (gauge; the name is
//!   legacy, the value covers all watched workload kinds)
//! - `vpa_operator_webhook_requests_total{operation,result,error_type}` (counter)
//! - `vpa_operator_webhook_duration_seconds{operation,result}` (histogram)
//! - `vpa_operator_vpa_operations_total{operation,vpamanager}` (counter)

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::time::Instant;

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::Error;

pub const ERROR_TYPE_NOT_FOUND: &str = "not_found";
pub const ERROR_TYPE_CONFLICT: &str = "conflict";
pub const ERROR_TYPE_VALIDATION: &str = "validation";
pub const ERROR_TYPE_API_SERVER: &str = "api_server";
pub const ERROR_TYPE_UNKNOWN: &str = "unknown";

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";

/// The standard Prometheus default buckets, in seconds.
const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Labels for the reconcile counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub vpamanager: String,
    pub result: String,
    pub error_type: String,
}

/// Labels for the reconcile duration histogram
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileDurationLabels {
    pub vpamanager: String,
    pub result: String,
}

/// Labels for per-manager state gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ManagerLabels {
    pub vpamanager: String,
}

/// Labels for the webhook request counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub operation: String,
    pub result: String,
    pub error_type: String,
}

/// Labels for the webhook duration histogram
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookDurationLabels {
    pub operation: String,
    pub result: String,
}

/// Labels for VPA lifecycle operations
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VpaOperationLabels {
    pub operation: String,
    pub vpamanager: String,
}

/// Counter tracking reconciliations by result and error type
pub static RECONCILE_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking reconcile duration in seconds
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileDurationLabels, Histogram>> =
    Lazy::new(|| {
        fn duration_histogram() -> Histogram {
            Histogram::new(DEFAULT_BUCKETS.iter().copied())
        }

        Family::new_with_constructor(duration_histogram)
    });

/// Gauge tracking the number of managed VPAs per manager
pub static MANAGED_VPAS: Lazy<Family<ManagerLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the number of watched workloads per manager
pub static WATCHED_DEPLOYMENTS: Lazy<Family<ManagerLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Counter tracking webhook requests by operation, result, and error type
pub static WEBHOOK_REQUESTS_TOTAL: Lazy<Family<WebhookLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking webhook operation duration in seconds
pub static WEBHOOK_DURATION_SECONDS: Lazy<Family<WebhookDurationLabels, Histogram>> =
    Lazy::new(|| {
        fn duration_histogram() -> Histogram {
            Histogram::new(DEFAULT_BUCKETS.iter().copied())
        }

        Family::new_with_constructor(duration_histogram)
    });

/// Counter tracking VPA lifecycle operations (create, update, delete)
pub static VPA_OPERATIONS_TOTAL: Lazy<Family<VpaOperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    // The text encoder appends `_total` to counter names.
    registry.register(
        "vpa_operator_reconcile",
        "Total number of reconciliations by result and error type",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "vpa_operator_reconcile_duration_seconds",
        "Duration of reconciliation in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "vpa_operator_managed_vpas",
        "Number of VPAs managed by the operator per VpaManager",
        MANAGED_VPAS.clone(),
    );
    registry.register(
        "vpa_operator_watched_deployments",
        "Number of workloads watched by the operator per VpaManager",
        WATCHED_DEPLOYMENTS.clone(),
    );
    registry.register(
        "vpa_operator_webhook_requests",
        "Total number of webhook requests by operation, result, and error type",
        WEBHOOK_REQUESTS_TOTAL.clone(),
    );
    registry.register(
        "vpa_operator_webhook_duration_seconds",
        "Duration of webhook operations in seconds",
        WEBHOOK_DURATION_SECONDS.clone(),
    );
    registry.register(
        "vpa_operator_vpa_operations",
        "Total number of VPA lifecycle operations (create, update, delete)",
        VPA_OPERATIONS_TOTAL.clone(),
    );

    registry
});

/// Render the registry in Prometheus text exposition format.
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

/// Record one reconciliation attempt.
pub fn record_reconcile(manager: &str, start: Instant, err: Option<&Error>) {
    let duration = start.elapsed().as_secs_f64();
    let (result, error_type) = classify_result(err);

    RECONCILE_TOTAL
        .get_or_create(&ReconcileLabels {
            vpamanager: manager.to_string(),
            result: result.to_string(),
            error_type: error_type.to_string(),
        })
        .inc();
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileDurationLabels {
            vpamanager: manager.to_string(),
            result: result.to_string(),
        })
        .observe(duration);
}

/// Record one admission webhook invocation.
pub fn record_admission(operation: &str, start: Instant, err: Option<&Error>) {
    let duration = start.elapsed().as_secs_f64();
    let (result, error_type) = classify_result(err);

    WEBHOOK_REQUESTS_TOTAL
        .get_or_create(&WebhookLabels {
            operation: operation.to_string(),
            result: result.to_string(),
            error_type: error_type.to_string(),
        })
        .inc();
    WEBHOOK_DURATION_SECONDS
        .get_or_create(&WebhookDurationLabels {
            operation: operation.to_string(),
            result: result.to_string(),
        })
        .observe(duration);
}

/// Record one VPA lifecycle operation (create, update, delete).
pub fn record_vpa_operation(operation: &str, manager: &str) {
    VPA_OPERATIONS_TOTAL
        .get_or_create(&VpaOperationLabels {
            operation: operation.to_string(),
            vpamanager: manager.to_string(),
        })
        .inc();
}

/// Update the managed-VPAs and watched-workloads gauges for a manager.
pub fn update_managed_gauges(manager: &str, managed_vpas: i64, watched_workloads: i64) {
    let labels = ManagerLabels {
        vpamanager: manager.to_string(),
    };
    MANAGED_VPAS.get_or_create(&labels).set(managed_vpas);
    WATCHED_DEPLOYMENTS
        .get_or_create(&labels)
        .set(watched_workloads);
}

fn classify_result(err: Option<&Error>) -> (&'static str, &'static str) {
    match err {
        None => (RESULT_SUCCESS, ""),
        Some(err) => (RESULT_ERROR, classify_error(err)),
    }
}

/// Categorize an error for metrics by substring on its message.
pub fn classify_error(err: &Error) -> &'static str {
    classify_error_message(&err.to_string())
}

/// Substring-based error classification shared by both convergence paths.
pub fn classify_error_message(message: &str) -> &'static str {
    if contains_any(message, &["not found", "NotFound"]) {
        ERROR_TYPE_NOT_FOUND
    } else if contains_any(message, &["conflict", "Conflict", "already exists"]) {
        ERROR_TYPE_CONFLICT
    } else if contains_any(message, &["validation", "invalid", "Invalid"]) {
        ERROR_TYPE_VALIDATION
    } else if contains_any(
        message,
        &[
            "connection refused",
            "timeout",
            "context deadline",
            "timed out",
            "error trying to connect",
        ],
    ) {
        ERROR_TYPE_API_SERVER
    } else {
        ERROR_TYPE_UNKNOWN
    }
}

fn contains_any(message: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| message.contains(needle))
}
