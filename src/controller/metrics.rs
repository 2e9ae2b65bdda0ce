//! Prometheus metrics for the anck operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `anck_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `anck_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `anck_stream_operation_failures_total` (counter): failed broker stream operations labeled by operation and domain.
//! - `anck_participating_nodes` (gauge): nodes of a network labeled by namespace/network/state.
//! - `anck_secret_operations_total` (counter): secret writes labeled by action.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::{NodeState, ParticipationStatus};

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "network"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller name, e.g. "network"
    pub controller: String,
    /// Error kind/category, e.g. "kube", "config", "broker"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StreamOperationLabels {
    pub operation: String,
    pub domain: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ParticipationLabels {
    pub namespace: String,
    pub network: String,
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SecretLabels {
    /// "create", "update" or "delete"
    pub action: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static STREAM_OPERATION_FAILURES_TOTAL: Lazy<
    Family<StreamOperationLabels, Counter<u64, AtomicU64>>,
> = Lazy::new(Family::default);

/// Gauge tracking nodes per lifecycle state of each network
pub static PARTICIPATING_NODES: Lazy<Family<ParticipationLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static SECRET_OPERATIONS_TOTAL: Lazy<Family<SecretLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "anck_reconcile_duration_seconds",
        "Duration of reconcile passes",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "anck_reconcile_errors",
        "Reconcile passes that ended in an error",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "anck_stream_operation_failures",
        "Failed broker stream operations",
        STREAM_OPERATION_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "anck_participating_nodes",
        "Nodes taking part in a network, by lifecycle state",
        PARTICIPATING_NODES.clone(),
    );
    registry.register(
        "anck_secret_operations",
        "Component secret writes",
        SECRET_OPERATIONS_TOTAL.clone(),
    );
    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_stream_operation_failure(operation: &str, domain: &str) {
    let labels = StreamOperationLabels {
        operation: operation.to_string(),
        domain: domain.to_string(),
    };
    STREAM_OPERATION_FAILURES_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_secret_operation(action: &str) {
    let labels = SecretLabels {
        action: action.to_string(),
    };
    SECRET_OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

/// Publish node counts per state for a network
pub fn set_participation(namespace: &str, network: &str, status: &ParticipationStatus) {
    for state in [NodeState::Pending, NodeState::Active, NodeState::Terminating] {
        let count = status.nodes.values().filter(|s| **s == state).count();
        let labels = ParticipationLabels {
            namespace: namespace.to_string(),
            network: network.to_string(),
            state: state.to_string(),
        };
        PARTICIPATING_NODES
            .get_or_create(&labels)
            .set(count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn render() -> String {
        let mut out = String::new();
        encode(&mut out, &REGISTRY).unwrap();
        out
    }

    #[test]
    fn test_registry_exports_families() {
        observe_reconcile_duration_seconds("network", 0.25);
        inc_reconcile_error("network", "broker");
        let out = render();
        assert!(out.contains("anck_reconcile_duration_seconds"));
        assert!(out.contains(r#"anck_reconcile_errors_total{controller="network",kind="broker"}"#));
    }

    #[test]
    fn test_stream_failure_counter() {
        inc_stream_operation_failure("delete", "edge-metrics-test");
        let labels = StreamOperationLabels {
            operation: "delete".to_string(),
            domain: "edge-metrics-test".to_string(),
        };
        assert_eq!(STREAM_OPERATION_FAILURES_TOTAL.get_or_create(&labels).get(), 1);
    }

    #[test]
    fn test_participation_gauge() {
        let mut status = ParticipationStatus::default();
        status.nodes.insert("a".to_string(), NodeState::Active);
        status.nodes.insert("b".to_string(), NodeState::Active);
        status.nodes.insert("c".to_string(), NodeState::Pending);
        set_participation("ns", "gauge-test", &status);

        let get = |state: &str| {
            PARTICIPATING_NODES
                .get_or_create(&ParticipationLabels {
                    namespace: "ns".to_string(),
                    network: "gauge-test".to_string(),
                    state: state.to_string(),
                })
                .get()
        };
        assert_eq!(get("active"), 2);
        assert_eq!(get("pending"), 1);
        assert_eq!(get("terminating"), 0);
    }
}
