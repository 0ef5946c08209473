//! Node label convergence
//!
//! [`reconcile_labels`] maps the labels a node carries today to the labels it
//! must carry, given the cluster's sandbox setting. It is idempotent: feeding
//! its output back in yields no further change, so one pass per node reaches
//! the fixed point regardless of the order nodes are visited in.

use crate::labels::{
    self, has_common_label, has_gpu_labels, has_mig_manager, operands_disabled, GPU_PRESENT,
    MIG_MANAGER, TRUE,
};
use crate::mig::is_mig_capable;
use crate::workload::WorkloadConfig;
use crate::Labels;

/// Result of converging one node's labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelOutcome {
    /// Full target label set
    pub labels: Labels,
    /// Whether `labels` differs from the input
    pub changed: bool,
    /// Whether the node counts as an accelerator node after convergence
    pub has_gpu: bool,
    /// Workload mode applied to the node
    pub workload: WorkloadConfig,
    /// Why the workload mode fell back, if it did
    pub warning: Option<String>,
}

/// Converge a node's labels
///
/// Hardware presence is settled first: the common label is set on first
/// sight of a discovery label, and reset to `false` (with every mode label
/// stripped) once discovery no longer reports hardware. The operands override
/// strips every managed label whatever the hardware state; otherwise mode
/// labels are only maintained on nodes that end up with `gpu.present=true`.
pub fn reconcile_labels(
    current: &Labels,
    sandbox_enabled: bool,
    fallback: WorkloadConfig,
) -> LabelOutcome {
    let mut labels = current.clone();
    let (workload, warning) = WorkloadConfig::resolve(current, sandbox_enabled, fallback);
    let mut changed = false;

    let hardware = has_gpu_labels(&labels);
    if hardware && !has_common_label(&labels) {
        labels.insert(GPU_PRESENT.to_string(), TRUE.to_string());
        changed = true;
    } else if !hardware && has_common_label(&labels) {
        labels.insert(GPU_PRESENT.to_string(), "false".to_string());
        labels::strip_managed(&mut labels);
        changed = true;
    }

    let has_gpu = has_common_label(&labels);
    if operands_disabled(&labels) {
        changed |= labels::strip_managed(&mut labels);
    } else if has_gpu {
        changed |= apply_mode_labels(&mut labels, workload);
    }

    LabelOutcome {
        labels,
        changed,
        has_gpu,
        workload,
        warning,
    }
}

/// Bring the deployment labels in line with `workload`
///
/// Pre-existing values of target labels are preserved, so an administrator
/// can pin an individual operand off with `<label>=false`.
pub fn apply_mode_labels(labels: &mut Labels, workload: WorkloadConfig) -> bool {
    if operands_disabled(labels) {
        return labels::strip_managed(labels);
    }
    let removed = remove_foreign_labels(labels, workload);
    let added = add_family_labels(labels, workload);
    removed || added
}

fn add_family_labels(labels: &mut Labels, workload: WorkloadConfig) -> bool {
    let mut changed = false;
    for key in workload.family() {
        if !labels.contains_key(*key) {
            labels.insert(key.to_string(), TRUE.to_string());
            changed = true;
        }
    }
    if workload == WorkloadConfig::Container && is_mig_capable(labels) && !has_mig_manager(labels)
    {
        labels.insert(MIG_MANAGER.to_string(), TRUE.to_string());
        changed = true;
    }
    changed
}

fn remove_foreign_labels(labels: &mut Labels, workload: WorkloadConfig) -> bool {
    let target = workload.family();
    let mut changed = false;
    for other in WorkloadConfig::ALL.into_iter().filter(|c| *c != workload) {
        for key in other.family() {
            if !target.contains(key) {
                changed |= labels.remove(*key).is_some();
            }
        }
    }
    if workload != WorkloadConfig::Container {
        changed |= labels.remove(MIG_MANAGER).is_some();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{
        CONTAINER_FAMILY, GPU_DISCOVERY, GPU_PRODUCT, OPERANDS, VM_PASSTHROUGH_FAMILY,
        VM_VGPU_FAMILY, WORKLOAD_CONFIG,
    };

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fresh_gpu_node() -> Labels {
        labels(&[
            (GPU_DISCOVERY[0], "true"),
            ("kubernetes.io/hostname", "gpu-0"),
        ])
    }

    // =========================================================================
    // Hardware Presence Stories
    // =========================================================================

    /// Story: A freshly discovered node gets the common label and the container family
    #[test]
    fn story_fresh_node_gets_container_stack() {
        let out = reconcile_labels(&fresh_gpu_node(), false, WorkloadConfig::Container);

        assert!(out.changed);
        assert!(out.has_gpu);
        assert_eq!(out.labels.get(GPU_PRESENT).map(String::as_str), Some("true"));
        for key in CONTAINER_FAMILY {
            assert_eq!(out.labels.get(key).map(String::as_str), Some("true"), "{key}");
        }
        assert!(!out.labels.contains_key(MIG_MANAGER));
        assert_eq!(out.labels.get("kubernetes.io/hostname").unwrap(), "gpu-0");
    }

    /// Story: A node whose accelerators disappear is reset, not unlabeled
    #[test]
    fn story_node_losing_hardware_is_reset_to_false() {
        let mut current = reconcile_labels(&fresh_gpu_node(), false, Default::default()).labels;
        current.remove(GPU_DISCOVERY[0]);

        let out = reconcile_labels(&current, false, Default::default());

        assert!(out.changed);
        assert!(!out.has_gpu);
        assert_eq!(out.labels.get(GPU_PRESENT).map(String::as_str), Some("false"));
        assert!(labels::all_managed().all(|k| !out.labels.contains_key(k)));

        let again = reconcile_labels(&out.labels, false, Default::default());
        assert!(!again.changed);
    }

    #[test]
    fn node_without_hardware_is_untouched() {
        let current = labels(&[("kubernetes.io/hostname", "cpu-0")]);
        let out = reconcile_labels(&current, false, Default::default());
        assert!(!out.changed);
        assert!(!out.has_gpu);
        assert_eq!(out.labels, current);
    }

    // =========================================================================
    // Mode Labeling Stories
    // =========================================================================

    /// Story: Switching a node to vm-vgpu removes container labels but keeps shared ones
    #[test]
    fn story_switch_to_vgpu_swaps_families() {
        let mut current = reconcile_labels(&fresh_gpu_node(), true, Default::default()).labels;
        current.insert(
            VM_PASSTHROUGH_FAMILY[0].to_string(),
            "true".to_string(),
        );
        current.insert(WORKLOAD_CONFIG.to_string(), "vm-vgpu".to_string());

        let out = reconcile_labels(&current, true, Default::default());

        assert_eq!(out.workload, WorkloadConfig::VmVgpu);
        for key in CONTAINER_FAMILY {
            assert!(!out.labels.contains_key(key), "{key} should be removed");
        }
        for key in VM_VGPU_FAMILY {
            assert!(out.labels.contains_key(key), "{key} should be present");
        }
        // sandbox-device-plugin is shared by both VM families
        assert!(out.labels.contains_key(VM_PASSTHROUGH_FAMILY[0]));
        assert!(!out.labels.contains_key("xdxct.com/gpu.deploy.vfio-manager"));
    }

    /// Story: An administrator pins one operand off and the operator respects it
    #[test]
    fn story_existing_family_value_is_preserved() {
        let mut current = fresh_gpu_node();
        current.insert(CONTAINER_FAMILY[3].to_string(), "false".to_string());

        let out = reconcile_labels(&current, false, Default::default());

        assert_eq!(
            out.labels.get(CONTAINER_FAMILY[3]).map(String::as_str),
            Some("false")
        );
    }

    /// Story: operands=false strips everything the operator manages
    #[test]
    fn story_operands_disabled_strips_managed_labels() {
        let mut current = reconcile_labels(&fresh_gpu_node(), false, Default::default()).labels;
        current.insert(OPERANDS.to_string(), "false".to_string());

        let out = reconcile_labels(&current, false, Default::default());

        assert!(out.changed);
        assert!(out.has_gpu);
        assert!(labels::all_managed().all(|k| !out.labels.contains_key(k)));
        assert_eq!(out.labels.get(OPERANDS).map(String::as_str), Some("false"));
    }

    /// Story: the override applies to nodes that never got the common label
    #[test]
    fn story_operands_disabled_without_common_label() {
        let current = labels(&[
            (OPERANDS, "false"),
            (CONTAINER_FAMILY[0], "true"),
            (MIG_MANAGER, "true"),
        ]);

        let out = reconcile_labels(&current, false, Default::default());

        assert!(out.changed);
        assert!(!out.has_gpu);
        assert!(labels::all_managed().all(|k| !out.labels.contains_key(k)));
        assert!(!reconcile_labels(&out.labels, false, Default::default()).changed);
    }

    // =========================================================================
    // MIG Manager Stories
    // =========================================================================

    #[test]
    fn mig_manager_added_for_capable_container_node() {
        let mut current = fresh_gpu_node();
        current.insert(GPU_PRODUCT.to_string(), "XDX-A100".to_string());

        let out = reconcile_labels(&current, false, Default::default());
        assert_eq!(out.labels.get(MIG_MANAGER).map(String::as_str), Some("true"));
    }

    #[test]
    fn mig_manager_removed_outside_container_mode() {
        let mut current = fresh_gpu_node();
        current.insert(GPU_PRODUCT.to_string(), "XDX-A100".to_string());
        current.insert(MIG_MANAGER.to_string(), "true".to_string());
        current.insert(WORKLOAD_CONFIG.to_string(), "vm-passthrough".to_string());

        let out = reconcile_labels(&current, true, Default::default());
        assert!(!out.labels.contains_key(MIG_MANAGER));
    }

    #[test]
    fn existing_mig_manager_value_is_preserved() {
        let mut current = fresh_gpu_node();
        current.insert(GPU_PRODUCT.to_string(), "XDX-A100".to_string());
        current.insert(MIG_MANAGER.to_string(), "false".to_string());

        let out = reconcile_labels(&current, false, Default::default());
        assert_eq!(out.labels.get(MIG_MANAGER).map(String::as_str), Some("false"));
    }

    // =========================================================================
    // Idempotence
    // =========================================================================

    #[test]
    fn second_pass_changes_nothing() {
        for sandbox in [false, true] {
            for mode in ["container", "vm-passthrough", "vm-vgpu", "bogus"] {
                let mut current = fresh_gpu_node();
                current.insert(WORKLOAD_CONFIG.to_string(), mode.to_string());
                current.insert(GPU_PRODUCT.to_string(), "A30".to_string());

                let first = reconcile_labels(&current, sandbox, Default::default());
                let second = reconcile_labels(&first.labels, sandbox, Default::default());
                assert!(!second.changed, "sandbox={sandbox} mode={mode}");
                assert_eq!(first.labels, second.labels);
            }
        }
    }

    #[test]
    fn fallback_warning_is_reported() {
        let mut current = fresh_gpu_node();
        current.insert(WORKLOAD_CONFIG.to_string(), "bogus".to_string());

        let out = reconcile_labels(&current, true, WorkloadConfig::VmPassthrough);
        assert_eq!(out.workload, WorkloadConfig::VmPassthrough);
        assert!(out.warning.is_some());
    }
}
