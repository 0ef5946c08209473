//! Driver upgrade controller
//!
//! Runs beside the ClusterPolicy controller. Node-by-node upgrade transitions
//! belong to an [`UpgradeStateManager`]; this controller feeds it the current
//! state every couple of minutes and publishes its progress counters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use accel_common::crd::{ClusterPolicy, UpgradePolicySpec};
use accel_common::metrics::{self, UpgradeCounts};
use accel_common::Error;
use accel_node::labels::UPGRADE_STATE;
use accel_node::upgrade::DRIVER_APP_LABEL;
use accel_node::Labels;

use crate::controller::{Context, KubeClient, LabelPatch};

/// Requeue interval while auto-upgrade is on
///
/// Node transitions may fail to apply without any watched object changing.
pub const UPGRADE_REQUEUE: Duration = Duration::from_secs(120);

/// Upgrade state label values
pub mod states {
    /// The node runs an outdated driver
    pub const REQUIRED: &str = "upgrade-required";
    /// The node runs the current driver
    pub const DONE: &str = "upgrade-done";
    /// The upgrade failed and needs attention
    pub const FAILED: &str = "upgrade-failed";
}

/// Driver-managed nodes grouped by upgrade state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterUpgradeState {
    /// Upgrade state label value (empty when unset) to node names
    pub nodes: BTreeMap<String, Vec<String>>,
}

impl ClusterUpgradeState {
    /// Nodes running a driver pod
    pub fn total(&self) -> i32 {
        let total: usize = self.nodes.values().map(Vec::len).sum();
        i32::try_from(total).unwrap_or(i32::MAX)
    }

    fn count(&self, state: &str) -> i64 {
        self.nodes.get(state).map_or(0, |n| n.len() as i64)
    }

    /// Nodes between `upgrade-required` and `upgrade-done`
    pub fn in_progress(&self) -> i64 {
        self.nodes
            .iter()
            .filter(|(s, _)| {
                !matches!(
                    s.as_str(),
                    "" | states::REQUIRED | states::DONE | states::FAILED
                )
            })
            .map(|(_, n)| n.len() as i64)
            .sum()
    }

    /// Progress counters for the given limits
    ///
    /// `max_parallel` of zero means no parallelism limit. Available slots
    /// are bounded by both limits; failed nodes count as unavailable.
    pub fn counts(&self, max_parallel: i32, max_unavailable: i32) -> UpgradeCounts {
        let in_progress = self.in_progress();
        let failed = self.count(states::FAILED);
        let parallel_limit = if max_parallel == 0 {
            i64::from(self.total())
        } else {
            i64::from(max_parallel)
        };
        let available = (parallel_limit - in_progress)
            .min(i64::from(max_unavailable) - in_progress - failed)
            .max(0);

        UpgradeCounts {
            in_progress,
            done: self.count(states::DONE),
            failed,
            pending: self.count(states::REQUIRED),
            available,
        }
    }
}

/// Rolling driver upgrade orchestration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpgradeStateManager: Send + Sync {
    /// Snapshot the upgrade state of nodes running pods that match `selector`
    async fn build_state(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<ClusterUpgradeState, Error>;

    /// Drive node transitions toward the policy
    async fn apply_state(
        &self,
        state: &ClusterUpgradeState,
        policy: &UpgradePolicySpec,
    ) -> Result<(), Error>;
}

/// Reads upgrade state from node labels and reports it
///
/// Node transitions are performed by the external upgrade orchestrator;
/// `apply_state` only logs what it would hand over.
pub struct ObservingUpgradeManager {
    kube: Arc<dyn KubeClient>,
}

impl ObservingUpgradeManager {
    /// Create a manager backed by the given client
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl UpgradeStateManager for ObservingUpgradeManager {
    async fn build_state(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<ClusterUpgradeState, Error> {
        let pods = self
            .kube
            .list_pods(namespace, &selector_string(selector))
            .await?;
        let nodes = self.kube.list_nodes().await?;

        let mut state = ClusterUpgradeState::default();
        for node_name in pods.iter().filter_map(|p| p.spec.as_ref()?.node_name.clone()) {
            let label = nodes
                .iter()
                .find(|n| n.metadata.name.as_deref() == Some(node_name.as_str()))
                .and_then(|n| n.labels().get(UPGRADE_STATE).cloned())
                .unwrap_or_default();
            state.nodes.entry(label).or_default().push(node_name);
        }
        Ok(state)
    }

    async fn apply_state(
        &self,
        state: &ClusterUpgradeState,
        policy: &UpgradePolicySpec,
    ) -> Result<(), Error> {
        debug!(
            nodes = state.total(),
            max_parallel = policy.max_parallel_upgrades,
            "upgrade state handed to orchestrator"
        );
        Ok(())
    }
}

/// Remove the upgrade state label from every node
pub async fn clear_upgrade_state(kube: &dyn KubeClient) -> Result<(), Error> {
    info!("resetting driver upgrade state labels on all nodes");
    for node in kube.list_nodes().await? {
        if !node.labels().contains_key(UPGRADE_STATE) {
            continue;
        }
        let patch = LabelPatch::from([(UPGRADE_STATE.to_string(), None)]);
        kube.patch_node_labels(&node.name_any(), &patch).await?;
    }
    Ok(())
}

/// Reconcile driver upgrades for a ClusterPolicy
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
pub async fn reconcile(policy: Arc<ClusterPolicy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(upgrade_policy) = policy
        .spec
        .driver
        .upgrade_policy
        .as_ref()
        .filter(|p| p.auto_upgrade)
    else {
        info!("driver auto-upgrade disabled, cleaning up upgrade state");
        metrics::set_auto_upgrade_enabled(false);
        clear_upgrade_state(ctx.kube.as_ref()).await?;
        return Ok(Action::await_change());
    };
    metrics::set_auto_upgrade_enabled(true);

    let namespace = ctx.operator_namespace()?;
    let selector = Labels::from([(DRIVER_APP_LABEL.0.to_string(), DRIVER_APP_LABEL.1.to_string())]);
    let state = ctx.upgrades.build_state(namespace, &selector).await?;
    debug!(?state, "current cluster upgrade state");

    let total = state.total();
    let max_unavailable = match &upgrade_policy.max_unavailable {
        Some(limit) => limit.scaled(total, true)?,
        None => total,
    };
    let counts = state.counts(upgrade_policy.max_parallel_upgrades, max_unavailable);
    metrics::record_upgrade_counts(&counts);

    ctx.upgrades.apply_state(&state, upgrade_policy).await?;
    Ok(Action::requeue(UPGRADE_REQUEUE))
}

/// Error policy for the upgrade controller
pub fn error_policy(policy: Arc<ClusterPolicy>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        policy = %policy.name_any(),
        "driver upgrade reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
