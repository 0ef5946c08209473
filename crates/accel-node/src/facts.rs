//! Discovery facts extracted from a Node object

use k8s_openapi::api::core::v1::Node;

use crate::labels::OSTREE_VERSION;
use crate::Labels;

/// The parts of a Node the operator reasons about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFacts {
    /// Node name
    pub name: String,
    /// Current labels
    pub labels: Labels,
    /// Current annotations
    pub annotations: Labels,
    /// Container runtime version string, e.g. `containerd://1.7.2`
    pub runtime_version: Option<String>,
}

impl NodeFacts {
    /// Extract facts from a Node
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
            runtime_version: node
                .status
                .as_ref()
                .and_then(|s| s.node_info.as_ref())
                .map(|i| i.container_runtime_version.clone())
                .filter(|v| !v.is_empty()),
        }
    }

    /// OS build identifier published by feature discovery
    pub fn os_build(&self) -> Option<&str> {
        self.labels.get(OSTREE_VERSION).map(String::as_str)
    }
}
