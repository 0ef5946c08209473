//! Node inventory pass
//!
//! Lists every node once, converges its classification labels and collects
//! the discovery facts later steps need: whether feature discovery runs at
//! all, which nodes carry accelerators, their runtimes and OS builds.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use accel_common::crd::{ClusterPolicySpec, Runtime};
use accel_common::Error;
use accel_node::labels::{self, TRUE};
use accel_node::upgrade::{annotation_change, AnnotationChange, AUTO_UPGRADE_ANNOTATION};
use accel_node::{detect_runtime, reconcile_labels, Labels, NodeFacts, WorkloadConfig};

use crate::controller::{KubeClient, LabelPatch};

/// Facts gathered by one pass over the node inventory
#[derive(Debug, Clone, Default)]
pub struct NodePass {
    /// Any node carries a feature discovery label
    pub has_nfd_labels: bool,
    /// Accelerator nodes, with their labels as written back
    pub gpu_nodes: Vec<NodeFacts>,
    /// Nodes whose labels were patched
    pub relabeled: usize,
}

impl NodePass {
    /// Cluster-wide container runtime sampled from accelerator nodes
    pub fn runtime(&self, fallback: Runtime) -> Runtime {
        detect_runtime(
            self.gpu_nodes.iter().map(|n| {
                (
                    n.name.as_str(),
                    n.runtime_version.as_deref().unwrap_or_default(),
                )
            }),
            fallback,
        )
    }

    /// OS build identifiers reported on accelerator nodes
    pub fn os_builds(&self) -> BTreeSet<String> {
        self.gpu_nodes
            .iter()
            .filter_map(|n| match n.os_build() {
                Some(build) => Some(build.to_string()),
                None => {
                    debug!(node = %n.name, "accelerator node reports no OS build");
                    None
                }
            })
            .collect()
    }
}

/// Workload mode for nodes without a usable workload label
pub fn default_workload(spec: &ClusterPolicySpec) -> WorkloadConfig {
    let configured = &spec.sandbox_workloads.default_workload;
    if configured.is_empty() {
        return WorkloadConfig::Container;
    }
    configured.parse().unwrap_or_else(|e: String| {
        warn!(error = %e, "invalid default workload in ClusterPolicy, using container");
        WorkloadConfig::Container
    })
}

/// Merge patch turning `old` into `new`; removed keys map to `None`
pub fn label_patch(old: &Labels, new: &Labels) -> LabelPatch {
    let removed = old
        .keys()
        .filter(|k| !new.contains_key(*k))
        .map(|k| (k.clone(), None));
    let changed = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), Some(v.clone())));
    removed.chain(changed).collect()
}

/// Converge every node's labels and collect discovery facts
pub async fn label_nodes(kube: &dyn KubeClient, spec: &ClusterPolicySpec) -> Result<NodePass, Error> {
    let sandbox = spec.sandbox_enabled();
    let fallback = default_workload(spec);
    let nodes = kube.list_nodes().await?;

    let mut pass = NodePass::default();
    for node in &nodes {
        let mut facts = NodeFacts::from_node(node);
        pass.has_nfd_labels |= labels::has_nfd_labels(&facts.labels);

        let outcome = reconcile_labels(&facts.labels, sandbox, fallback);
        if outcome.has_gpu {
            if let Some(warning) = &outcome.warning {
                warn!(node = %facts.name, workload = %outcome.workload, "{warning}, using default");
            }
        }

        if outcome.changed {
            let patch = label_patch(&facts.labels, &outcome.labels);
            info!(
                node = %facts.name,
                workload = %outcome.workload,
                changes = patch.len(),
                "applying accelerator labels"
            );
            kube.patch_node_labels(&facts.name, &patch).await?;
            pass.relabeled += 1;
        }

        if outcome.has_gpu {
            facts.labels = outcome.labels;
            pass.gpu_nodes.push(facts);
        }
    }

    Ok(pass)
}

/// Keep the driver auto-upgrade annotation on accelerator nodes in line with `wanted`
pub async fn sync_upgrade_annotations(
    kube: &dyn KubeClient,
    gpu_nodes: &[NodeFacts],
    wanted: bool,
) -> Result<(), Error> {
    for node in gpu_nodes {
        let value = match annotation_change(&node.annotations, wanted) {
            AnnotationChange::None => continue,
            AnnotationChange::Set => Some(TRUE.to_string()),
            AnnotationChange::Remove => None,
        };
        debug!(node = %node.name, annotation = AUTO_UPGRADE_ANNOTATION, ?value, "updating upgrade annotation");
        let patch = LabelPatch::from([(AUTO_UPGRADE_ANNOTATION.to_string(), value)]);
        kube.patch_node_annotations(&node.name, &patch).await?;
    }
    Ok(())
}
