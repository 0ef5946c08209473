//! Node event filtering for the policy controller
//!
//! Node updates are frequent (heartbeats, conditions). Only changes that
//! would alter what the label pass computes trigger a reconciliation.

use crate::labels::{
    has_common_label, has_gpu_labels, has_mig_manager, operands_disabled, OSTREE_VERSION,
};
use crate::mig::is_mig_capable;
use crate::workload::WorkloadConfig;
use crate::Labels;

/// Reasons a node update needs the ClusterPolicy reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeChange {
    /// Discovery reports accelerators but the common label is missing
    pub common_label_missing: bool,
    /// Common label set but discovery no longer reports accelerators
    pub common_label_outdated: bool,
    /// MIG-capable node without the MIG manager label
    pub mig_manager_missing: bool,
    /// The operands override was toggled
    pub operands_toggled: bool,
    /// The workload label resolves to a different mode
    pub workload_changed: bool,
    /// The OS build label changed
    pub os_build_changed: bool,
}

impl NodeChange {
    /// Compare a node's labels before and after an update
    pub fn between(old: &Labels, new: &Labels) -> Self {
        let workload = |l: &Labels| WorkloadConfig::resolve(l, true, WorkloadConfig::Container).0;
        Self {
            common_label_missing: has_gpu_labels(new) && !has_common_label(new),
            common_label_outdated: !has_gpu_labels(new) && has_common_label(new),
            mig_manager_missing: is_mig_capable(new) && !has_mig_manager(new),
            operands_toggled: operands_disabled(old) != operands_disabled(new),
            workload_changed: workload(old) != workload(new),
            os_build_changed: old.get(OSTREE_VERSION) != new.get(OSTREE_VERSION),
        }
    }

    /// True when any reason applies
    pub fn needs_reconcile(&self) -> bool {
        self.common_label_missing
            || self.common_label_outdated
            || self.mig_manager_missing
            || self.operands_toggled
            || self.workload_changed
            || self.os_build_changed
    }
}

/// A newly seen node matters only if it has accelerators
pub fn created_needs_reconcile(labels: &Labels) -> bool {
    has_gpu_labels(labels)
}

/// A deleted accelerator node with an OS build may leave a stale toolkit DaemonSet
pub fn deleted_needs_reconcile(labels: &Labels) -> bool {
    has_gpu_labels(labels) && labels.contains_key(OSTREE_VERSION)
}
