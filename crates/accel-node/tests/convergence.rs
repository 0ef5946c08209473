//! Convergence properties of the node label pass
//!
//! These exercise the public API only, the way the policy controller drives
//! it: every node in the inventory is passed through `reconcile_labels` once
//! per reconciliation and the result is written back.

use accel_node::labels::{
    self, CONTAINER_FAMILY, GPU_DISCOVERY, GPU_PRESENT, GPU_PRODUCT, MIG_MANAGER, OPERANDS,
    VM_PASSTHROUGH_FAMILY, VM_VGPU_FAMILY, WORKLOAD_CONFIG,
};
use accel_node::{reconcile_labels, Labels, WorkloadConfig};

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A small but varied fleet
fn fleet() -> Vec<Labels> {
    vec![
        labels(&[("kubernetes.io/hostname", "cpu-0")]),
        labels(&[(GPU_DISCOVERY[0], "true")]),
        labels(&[(GPU_DISCOVERY[1], "true"), (GPU_PRODUCT, "XDX-H100")]),
        labels(&[
            (GPU_DISCOVERY[2], "true"),
            (WORKLOAD_CONFIG, "vm-passthrough"),
            (CONTAINER_FAMILY[0], "true"),
        ]),
        labels(&[
            (GPU_DISCOVERY[0], "true"),
            (WORKLOAD_CONFIG, "vm-vgpu"),
            (MIG_MANAGER, "true"),
        ]),
        labels(&[(GPU_DISCOVERY[0], "true"), (OPERANDS, "false")]),
        labels(&[(GPU_PRESENT, "true"), (CONTAINER_FAMILY[2], "true")]),
        labels(&[(GPU_DISCOVERY[0], "true"), (WORKLOAD_CONFIG, "nonsense")]),
        labels(&[
            (OPERANDS, "false"),
            (CONTAINER_FAMILY[0], "true"),
            (MIG_MANAGER, "true"),
        ]),
        labels(&[(GPU_DISCOVERY[1], "true"), (MIG_MANAGER, "true")]),
    ]
}

fn family_present(l: &Labels, family: &[&str]) -> bool {
    family.iter().any(|k| l.contains_key(*k))
}

#[test]
fn one_pass_reaches_the_fixed_point() {
    for sandbox in [false, true] {
        for node in fleet() {
            let first = reconcile_labels(&node, sandbox, WorkloadConfig::Container);
            let second = reconcile_labels(&first.labels, sandbox, WorkloadConfig::Container);
            assert!(!second.changed, "not converged: {node:?} sandbox={sandbox}");
            assert_eq!(first.labels, second.labels);
            assert_eq!(first.has_gpu, second.has_gpu);
        }
    }
}

#[test]
fn changed_flag_matches_label_difference() {
    for sandbox in [false, true] {
        for node in fleet() {
            let out = reconcile_labels(&node, sandbox, WorkloadConfig::Container);
            assert_eq!(out.changed, out.labels != node, "{node:?}");
        }
    }
}

#[test]
fn visitation_order_does_not_matter() {
    let forward: Vec<Labels> = fleet()
        .iter()
        .map(|n| reconcile_labels(n, true, WorkloadConfig::Container).labels)
        .collect();
    let mut backward: Vec<Labels> = fleet()
        .iter()
        .rev()
        .map(|n| reconcile_labels(n, true, WorkloadConfig::Container).labels)
        .collect();
    backward.reverse();
    assert_eq!(forward, backward);
}

#[test]
fn modes_are_exclusive() {
    for node in fleet() {
        let out = reconcile_labels(&node, true, WorkloadConfig::Container);
        if !out.has_gpu || labels::operands_disabled(&out.labels) {
            continue;
        }
        let container_only = CONTAINER_FAMILY;
        let passthrough_only = ["xdxct.com/gpu.deploy.vfio-manager", "xdxct.com/gpu.deploy.kata-manager"];
        let vgpu_only = [
            "xdxct.com/gpu.deploy.vgpu-manager",
            "xdxct.com/gpu.deploy.vgpu-device-manager",
        ];
        let present = [
            family_present(&out.labels, &container_only),
            family_present(&out.labels, &passthrough_only),
            family_present(&out.labels, &vgpu_only),
        ];
        assert_eq!(
            present.iter().filter(|p| **p).count(),
            1,
            "exactly one family expected on {:?}",
            out.labels
        );
        let expected = out.workload.family();
        assert!(expected.iter().all(|k| out.labels.contains_key(*k)));
    }
}

#[test]
fn operands_disabled_nodes_carry_no_managed_labels() {
    for sandbox in [false, true] {
        for node in fleet() {
            let out = reconcile_labels(&node, sandbox, WorkloadConfig::Container);
            if labels::operands_disabled(&out.labels) {
                assert!(
                    labels::all_managed().all(|k| !out.labels.contains_key(k)),
                    "{node:?} sandbox={sandbox}"
                );
            }
        }
    }
}

#[test]
fn mig_manager_only_in_container_mode() {
    for sandbox in [false, true] {
        for node in fleet() {
            let out = reconcile_labels(&node, sandbox, WorkloadConfig::Container);
            if out.labels.contains_key(MIG_MANAGER) {
                assert_eq!(out.workload, WorkloadConfig::Container, "{:?}", out.labels);
            }
        }
    }
}

/// An administrator-set MIG manager label on a node that is not MIG capable
/// is kept in container mode; only leaving container mode removes it.
#[test]
fn existing_mig_manager_label_survives_in_container_mode() {
    let node = labels(&[(GPU_DISCOVERY[1], "true"), (MIG_MANAGER, "true")]);

    let container = reconcile_labels(&node, false, WorkloadConfig::Container);
    assert_eq!(container.workload, WorkloadConfig::Container);
    assert_eq!(
        container.labels.get(MIG_MANAGER).map(String::as_str),
        Some("true")
    );

    let mut vgpu = node.clone();
    vgpu.insert(WORKLOAD_CONFIG.to_string(), "vm-vgpu".to_string());
    let out = reconcile_labels(&vgpu, true, WorkloadConfig::Container);
    assert!(!out.labels.contains_key(MIG_MANAGER));
}

#[test]
fn stale_common_label_is_reset() {
    let node = labels(&[(GPU_PRESENT, "true"), (CONTAINER_FAMILY[2], "true")]);
    let out = reconcile_labels(&node, false, WorkloadConfig::Container);
    assert_eq!(out.labels.get(GPU_PRESENT).map(String::as_str), Some("false"));
    assert!(!family_present(&out.labels, &CONTAINER_FAMILY));
    assert!(!family_present(&out.labels, &VM_PASSTHROUGH_FAMILY));
    assert!(!family_present(&out.labels, &VM_VGPU_FAMILY));
}
