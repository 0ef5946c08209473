//! Well-known node label keys and the predicates over them

use crate::Labels;

/// Common label marking a node as carrying accelerators
pub const GPU_PRESENT: &str = "xdxct.com/gpu.present";

/// Override: `false` strips every managed deployment label from the node
pub const OPERANDS: &str = "xdxct.com/gpu.deploy.operands";

/// Deploy the MIG manager on the node
pub const MIG_MANAGER: &str = "xdxct.com/gpu.deploy.mig-manager";

/// Explicit MIG capability published by feature discovery
pub const MIG_CAPABLE: &str = "xdxct.com/mig.capable";

/// vGPU host driver version; set only on vGPU hosts
pub const VGPU_HOST_DRIVER_VERSION: &str = "xdxct.com/vgpu.host-driver-version";

/// Accelerator product name
pub const GPU_PRODUCT: &str = "xdxct.com/gpu.product";

/// Administrator-selected workload mode
pub const WORKLOAD_CONFIG: &str = "xdxct.com/gpu.workload.config";

/// Upgrade state label maintained by the upgrade state manager
pub const UPGRADE_STATE: &str = "xdxct.com/gpu-driver-upgrade-state";

/// Prefix shared by every node feature discovery label
pub const NFD_PREFIX: &str = "feature.node.kubernetes.io/";

/// OS build identifier published by node feature discovery
pub const OSTREE_VERSION: &str = "feature.node.kubernetes.io/system-os_release.OSTREE_VERSION";

/// Value used by every managed label
pub const TRUE: &str = "true";

/// Hardware discovery labels; any one set to `true` means accelerators are present
pub const GPU_DISCOVERY: [&str; 3] = [
    "feature.node.kubernetes.io/pci-10de.present",
    "feature.node.kubernetes.io/pci-0302_10de.present",
    "feature.node.kubernetes.io/pci-0300_10de.present",
];

/// Deployment labels for plain container workloads
pub const CONTAINER_FAMILY: [&str; 6] = [
    "xdxct.com/gpu.deploy.driver",
    "xdxct.com/gpu.deploy.gpu-feature-discovery",
    "xdxct.com/gpu.deploy.container-toolkit",
    "xdxct.com/gpu.deploy.device-plugin",
    "xdxct.com/gpu.deploy.node-status-exporter",
    "xdxct.com/gpu.deploy.operator-validator",
];

/// Deployment labels for VMs with passthrough devices
pub const VM_PASSTHROUGH_FAMILY: [&str; 5] = [
    "xdxct.com/gpu.deploy.sandbox-device-plugin",
    "xdxct.com/gpu.deploy.sandbox-validator",
    "xdxct.com/gpu.deploy.vfio-manager",
    "xdxct.com/gpu.deploy.kata-manager",
    "xdxct.com/gpu.deploy.cc-manager",
];

/// Deployment labels for VMs with virtual GPUs
pub const VM_VGPU_FAMILY: [&str; 5] = [
    "xdxct.com/gpu.deploy.sandbox-device-plugin",
    "xdxct.com/gpu.deploy.vgpu-manager",
    "xdxct.com/gpu.deploy.vgpu-device-manager",
    "xdxct.com/gpu.deploy.sandbox-validator",
    "xdxct.com/gpu.deploy.cc-manager",
];

/// Every deployment label the operator may set, duplicates included
pub fn all_managed() -> impl Iterator<Item = &'static str> {
    CONTAINER_FAMILY
        .iter()
        .chain(VM_PASSTHROUGH_FAMILY.iter())
        .chain(VM_VGPU_FAMILY.iter())
        .copied()
        .chain(std::iter::once(MIG_MANAGER))
}

/// True when any hardware discovery label reports accelerators
pub fn has_gpu_labels(labels: &Labels) -> bool {
    GPU_DISCOVERY
        .iter()
        .any(|key| labels.get(*key).is_some_and(|v| v == TRUE))
}

/// True when the node already carries `gpu.present=true`
pub fn has_common_label(labels: &Labels) -> bool {
    labels.get(GPU_PRESENT).is_some_and(|v| v == TRUE)
}

/// True when node feature discovery has labeled the node at all
pub fn has_nfd_labels(labels: &Labels) -> bool {
    labels.keys().any(|k| k.starts_with(NFD_PREFIX))
}

/// True when the administrator disabled all operands on the node
pub fn operands_disabled(labels: &Labels) -> bool {
    labels.get(OPERANDS).is_some_and(|v| v == "false")
}

/// True when the MIG manager label exists, whatever its value
pub fn has_mig_manager(labels: &Labels) -> bool {
    labels.contains_key(MIG_MANAGER)
}

/// Remove every managed deployment label; returns whether anything changed
pub fn strip_managed(labels: &mut Labels) -> bool {
    let mut changed = false;
    for key in all_managed() {
        changed |= labels.remove(key).is_some();
    }
    changed
}
