//! Metrics registry for operator observability
//!
//! Provides OpenTelemetry metrics for:
//! - ClusterPolicy reconciliation (status, totals, failures, last success)
//! - Accelerator node inventory
//! - OpenShift driver toolkit availability
//! - Driver auto-upgrade progress

use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("accel-operator"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Gauge of the last reconciliation outcome
///
/// Values: 1 ready, 0 not ready, -1 ClusterPolicy unavailable
pub static RECONCILIATION_STATUS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_reconciliation_status")
        .with_description("Outcome of the last ClusterPolicy reconciliation")
        .build()
});

/// Counter of stage walks started
pub static RECONCILIATION_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("accel_operator_reconciliation_total")
        .with_description("Total number of ClusterPolicy reconciliations")
        .with_unit("{reconciliations}")
        .build()
});

/// Counter of walks that ended not ready or in error
pub static RECONCILIATION_FAILED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("accel_operator_reconciliation_failed_total")
        .with_description("Total number of ClusterPolicy reconciliations that did not reach ready")
        .with_unit("{reconciliations}")
        .build()
});

/// Unix timestamp of the last fully ready reconciliation
pub static RECONCILIATION_LAST_SUCCESS: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("accel_operator_reconciliation_last_success_ts_seconds")
        .with_description("Timestamp of the last successful ClusterPolicy reconciliation")
        .with_unit("s")
        .build()
});

/// Whether any node carries hardware discovery labels (1) or not (0)
pub static RECONCILIATION_HAS_NFD_LABELS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_reconciliation_has_nfd_labels")
        .with_description("Whether discovery labels were found on the cluster nodes")
        .build()
});

// ============================================================================
// Node Metrics
// ============================================================================

/// Number of nodes with accelerator hardware
pub static GPU_NODES_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_gpu_nodes_total")
        .with_description("Number of nodes with accelerators")
        .with_unit("{nodes}")
        .build()
});

// ============================================================================
// Driver Toolkit Metrics
// ============================================================================

/// Driver toolkit usage
///
/// Values: 1 enabled, 0 not requested, -1 requested but not possible
pub static DRIVER_TOOLKIT_ENABLED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_openshift_driver_toolkit_enabled")
        .with_description("Whether the OpenShift driver toolkit is used to build drivers")
        .build()
});

/// Whether the driver toolkit image stream is missing (1) or present (0)
pub static DRIVER_TOOLKIT_MISSING: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_openshift_driver_toolkit_imagestream_missing")
        .with_description("Whether the driver toolkit image stream is missing")
        .build()
});

/// Whether accelerator nodes lack the OS build label (1) or not (0)
pub static DRIVER_TOOLKIT_NFD_TOO_OLD: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_openshift_driver_toolkit_nfd_too_old")
        .with_description("Whether node feature discovery is too old to expose OS builds")
        .build()
});

// ============================================================================
// Driver Upgrade Metrics
// ============================================================================

/// Whether driver auto-upgrade is enabled (1) or disabled (0)
pub static DRIVER_AUTO_UPGRADE_ENABLED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_driver_auto_upgrade_enabled")
        .with_description("Whether driver auto-upgrade is enabled")
        .build()
});

/// Node counts by upgrade progress
///
/// Labels:
/// - `state`: in_progress, done, failed, pending, available
pub static UPGRADES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("accel_operator_driver_upgrades")
        .with_description("Number of nodes by driver upgrade state")
        .with_unit("{nodes}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Values recorded on [`RECONCILIATION_STATUS`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every enabled stage ready
    Ready,
    /// A stage is not ready or failed
    NotReady,
    /// The ClusterPolicy could not be read or initialized
    Unavailable,
}

impl ReconcileOutcome {
    /// Gauge value
    pub fn value(&self) -> i64 {
        match self {
            Self::Ready => 1,
            Self::NotReady => 0,
            Self::Unavailable => -1,
        }
    }
}

/// Values recorded on [`DRIVER_TOOLKIT_ENABLED`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverToolkitUsage {
    /// Drivers are built with the toolkit
    Enabled,
    /// Toolkit was not requested
    NotRequested,
    /// Toolkit requested but the cluster cannot provide it
    NotPossible,
}

impl DriverToolkitUsage {
    /// Gauge value
    pub fn value(&self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::NotRequested => 0,
            Self::NotPossible => -1,
        }
    }
}

/// Node counts reported by the upgrade state manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeCounts {
    /// Nodes currently upgrading
    pub in_progress: i64,
    /// Nodes on the current driver
    pub done: i64,
    /// Nodes whose upgrade failed
    pub failed: i64,
    /// Nodes waiting for an upgrade slot
    pub pending: i64,
    /// Slots available to start new upgrades
    pub available: i64,
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record the reconciliation outcome gauge
pub fn set_reconcile_outcome(outcome: ReconcileOutcome) {
    RECONCILIATION_STATUS.record(outcome.value(), &[]);
}

/// Record a reconciliation that did not reach ready
pub fn record_reconcile_failed() {
    set_reconcile_outcome(ReconcileOutcome::NotReady);
    RECONCILIATION_FAILED.add(1, &[]);
}

/// Record a fully ready reconciliation and stamp the success time
pub fn record_reconcile_success() {
    set_reconcile_outcome(ReconcileOutcome::Ready);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    RECONCILIATION_LAST_SUCCESS.record(now, &[]);
}

/// Record the facts gathered by the node label pass
pub fn record_node_facts(has_nfd_labels: bool, gpu_nodes: usize) {
    RECONCILIATION_HAS_NFD_LABELS.record(i64::from(has_nfd_labels), &[]);
    GPU_NODES_TOTAL.record(i64::try_from(gpu_nodes).unwrap_or(i64::MAX), &[]);
}

/// Record driver toolkit availability
pub fn record_driver_toolkit(usage: DriverToolkitUsage, missing: bool, nfd_too_old: bool) {
    DRIVER_TOOLKIT_ENABLED.record(usage.value(), &[]);
    DRIVER_TOOLKIT_MISSING.record(i64::from(missing), &[]);
    DRIVER_TOOLKIT_NFD_TOO_OLD.record(i64::from(nfd_too_old), &[]);
}

/// Record whether driver auto-upgrade is on
pub fn set_auto_upgrade_enabled(enabled: bool) {
    DRIVER_AUTO_UPGRADE_ENABLED.record(i64::from(enabled), &[]);
}

/// Record upgrade progress counters
pub fn record_upgrade_counts(counts: &UpgradeCounts) {
    for (state, value) in [
        ("in_progress", counts.in_progress),
        ("done", counts.done),
        ("failed", counts.failed),
        ("pending", counts.pending),
        ("available", counts.available),
    ] {
        UPGRADES.record(value, &[opentelemetry::KeyValue::new("state", state)]);
    }
}
