//! Node watch filtering
//!
//! The controller watches every node but only wants to hear about changes
//! the label pass would act on. `NodeTracker` remembers the last labels seen
//! per node so updates can be compared against them.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use kube::ResourceExt;
use tracing::debug;

use accel_node::watch::{created_needs_reconcile, deleted_needs_reconcile, NodeChange};
use accel_node::Labels;

/// Last seen labels of every node
#[derive(Debug, Default)]
pub struct NodeTracker {
    seen: HashMap<String, Labels>,
}

impl NodeTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a watch event; true when the ClusterPolicy should be reconciled
    pub fn observe(&mut self, event: &watcher::Event<Node>) -> bool {
        match event {
            watcher::Event::Init | watcher::Event::InitDone => false,
            watcher::Event::InitApply(node) => {
                self.seen.insert(node.name_any(), node.labels().clone());
                false
            }
            watcher::Event::Apply(node) => {
                let name = node.name_any();
                let labels = node.labels().clone();
                let trigger = match self.seen.get(&name) {
                    Some(previous) => {
                        let change = NodeChange::between(previous, &labels);
                        if change.needs_reconcile() {
                            debug!(node = %name, ?change, "node change needs reconcile");
                        }
                        change.needs_reconcile()
                    }
                    None => created_needs_reconcile(&labels),
                };
                self.seen.insert(name, labels);
                trigger
            }
            watcher::Event::Delete(node) => {
                let labels = self
                    .seen
                    .remove(&node.name_any())
                    .unwrap_or_else(|| node.labels().clone());
                deleted_needs_reconcile(&labels)
            }
        }
    }
}
