//! Driver toolkit availability check against the published image stream

use tracing::info;

use accel_common::crd::ClusterPolicySpec;
use accel_common::metrics::{self, DriverToolkitUsage};
use accel_common::Error;
use accel_node::toolkit::{IMAGE_STREAM_NAME, IMAGE_STREAM_NAMESPACE};
use accel_node::{CompatibilityIndex, DriverToolkitState};

use crate::controller::KubeClient;
use crate::probe::NodePass;

/// Decide whether driver builds can use the toolkit images
///
/// The index is only fetched when the toolkit is requested on OpenShift and
/// the driver is not precompiled.
pub async fn evaluate(
    kube: &dyn KubeClient,
    spec: &ClusterPolicySpec,
    openshift: bool,
    pass: &NodePass,
) -> Result<DriverToolkitState, Error> {
    let requested = openshift && spec.operator.use_openshift_driver_toolkit;
    let precompiled = spec.driver.use_precompiled();

    if !requested || precompiled {
        return Ok(DriverToolkitState::evaluate(
            requested,
            precompiled,
            None,
            pass.os_builds(),
        ));
    }

    let index = kube
        .get_image_stream(IMAGE_STREAM_NAMESPACE, IMAGE_STREAM_NAME)
        .await?
        .map(|stream| CompatibilityIndex::from_image_stream(&stream));
    let state = DriverToolkitState::evaluate(true, false, index.as_ref(), pass.os_builds());

    let usage = if state.enabled {
        DriverToolkitUsage::Enabled
    } else {
        DriverToolkitUsage::NotPossible
    };
    let nfd_too_old = !pass.gpu_nodes.is_empty() && !state.has_compatible_nodes;
    metrics::record_driver_toolkit(usage, !state.has_index, nfd_too_old);

    info!(
        enabled = state.enabled,
        has_index = state.has_index,
        has_compatible_nodes = state.has_compatible_nodes,
        missing = ?state.missing_builds().collect::<Vec<_>>(),
        "driver toolkit requested"
    );
    Ok(state)
}
